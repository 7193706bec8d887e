//! Ratchet Core
//!
//! Position risk engine for spot crypto trading: tracks open positions,
//! trails profits with a golden-ratio ratchet, enforces stops, and keeps a
//! drawdown circuit breaker, with durable state across restarts.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod secrets;
