pub mod adapters;
pub mod kraken_client;
pub mod nonce;
pub mod price_feed;
pub mod rate_limit;
pub mod retry;
pub mod venue;
