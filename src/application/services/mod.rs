pub mod trading_core;
