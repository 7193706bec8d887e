//! Exchange Client Trait
//!
//! The small, stable verb set the risk engine and trading core use to talk
//! to the venue. No strategy-level concept (positions, ratchets) crosses
//! this boundary; only order intents, results and market data do.
//!
//! Every method resolves to a value. Transport problems are retried inside
//! the implementation and only surface as `ExchangeError::Transport` once
//! the retry budget is spent.

use crate::domain::entities::market::{MarketLimits, OpenOrder, Ticker};
use crate::domain::entities::order::{OrderIntent, OrderResult};
use crate::domain::errors::ExchangeError;
use async_trait::async_trait;
use std::collections::HashMap;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Get the name of this exchange
    fn name(&self) -> &str;

    /// Establish the session: clock-offset handshake and market metadata
    async fn connect(&self) -> ExchangeResult<()>;

    async fn get_ticker(&self, pair: &str) -> ExchangeResult<Ticker>;

    /// Free balance per canonical asset symbol
    async fn get_balance(&self) -> ExchangeResult<HashMap<String, f64>>;

    /// Cached venue limits for `pair`
    async fn get_limits(&self, pair: &str) -> ExchangeResult<MarketLimits>;

    /// Execute an intent. Failures are reported inside the result.
    async fn place_order(&self, intent: &OrderIntent) -> OrderResult;

    async fn cancel(&self, order_id: &str) -> ExchangeResult<()>;

    async fn open_orders(&self, pair: Option<&str>) -> ExchangeResult<Vec<OpenOrder>>;

    async fn is_healthy(&self) -> bool {
        true
    }
}
