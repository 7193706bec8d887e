pub mod exchange_adapter;
