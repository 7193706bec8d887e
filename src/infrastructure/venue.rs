//! Low-level venue verbs the exchange adapter is built on.
//!
//! Implementations own transport concerns (signing, nonces, retries, rate
//! limiting) and translate venue payloads into domain types. Strategy-level
//! decisions such as spread checks and fallbacks live in the adapter.

use crate::domain::entities::market::{MarketLimits, OpenOrder, Ticker};
use crate::domain::entities::order::{OrderSide, OrderType};
use crate::domain::repositories::exchange_client::ExchangeResult;
use async_trait::async_trait;
use std::collections::HashMap;

/// Fully resolved order ready for submission
#[derive(Debug, Clone, PartialEq)]
pub struct VenueOrder {
    /// Canonical `BASE/QUOTE` pair
    pub pair: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Base quantity, already floored to the lot precision
    pub volume: f64,
    /// Limit price, already rounded to the price precision
    pub price: Option<f64>,
    pub post_only: bool,
    /// Attached stop-loss leg (one-triggers-other)
    pub stop_price: Option<f64>,
    pub price_decimals: u32,
    pub lot_decimals: u32,
}

impl VenueOrder {
    pub fn market(pair: &str, side: OrderSide, volume: f64, limits: &MarketLimits) -> Self {
        Self {
            pair: pair.to_string(),
            side,
            order_type: OrderType::Market,
            volume,
            price: None,
            post_only: false,
            stop_price: None,
            price_decimals: limits.price_decimals,
            lot_decimals: limits.lot_decimals,
        }
    }

    pub fn post_only_limit(
        pair: &str,
        side: OrderSide,
        volume: f64,
        price: f64,
        limits: &MarketLimits,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            post_only: true,
            ..Self::market(pair, side, volume, limits)
        }
    }

    pub fn with_stop(mut self, stop_price: Option<f64>) -> Self {
        self.stop_price = stop_price;
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Open,
    Closed,
    Canceled,
    Expired,
}

impl OrderState {
    pub fn parse(status: &str) -> Self {
        match status {
            "open" => OrderState::Open,
            "closed" => OrderState::Closed,
            "canceled" => OrderState::Canceled,
            "expired" => OrderState::Expired,
            _ => OrderState::Pending,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderState::Closed | OrderState::Canceled | OrderState::Expired
        )
    }
}

/// Execution status of one order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_id: String,
    pub state: OrderState,
    pub volume: f64,
    pub executed: f64,
    /// Average execution price; zero before the first fill
    pub avg_price: f64,
}

#[async_trait]
pub trait VenueApi: Send + Sync {
    /// Clock handshake; returns the measured offset in milliseconds
    async fn sync_clock(&self) -> ExchangeResult<i64>;

    async fn ticker(&self, pair: &str) -> ExchangeResult<Ticker>;

    async fn asset_pair(&self, pair: &str) -> ExchangeResult<MarketLimits>;

    /// Total balances keyed by canonical asset
    async fn balances(&self) -> ExchangeResult<HashMap<String, f64>>;

    /// Balances minus amounts held by open orders
    async fn free_balances(&self) -> ExchangeResult<HashMap<String, f64>>;

    /// Submit an order; returns the venue order id
    async fn add_order(&self, order: &VenueOrder) -> ExchangeResult<String>;

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()>;

    async fn open_orders(&self) -> ExchangeResult<Vec<OpenOrder>>;

    async fn query_order(&self, order_id: &str) -> ExchangeResult<OrderFill>;
}
