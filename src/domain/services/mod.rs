pub mod book_writer;
pub mod circuit_breaker;
pub mod exposure;
pub mod position_manager;
pub mod ratchet;
