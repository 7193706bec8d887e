pub mod book_store;
pub mod exchange_client;
