pub mod exit_decision;
pub mod pnl;
pub mod price;
pub mod quantity;
