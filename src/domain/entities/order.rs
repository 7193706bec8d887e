use crate::domain::entities::market::base_asset;
use crate::domain::errors::{ExchangeError, ValidationError};
use crate::domain::value_objects::{price::Price, quantity::Quantity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Wire value expected by the venue
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

/// How the adapter may take or make liquidity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStyle {
    /// Straight market order
    Market,
    /// Post-only limit at the touch, market fallback on rejection or no fill
    MakerPreferred,
    /// Post-only limit at the touch; never takes liquidity
    MakerOnly,
}

impl ExecutionStyle {
    pub fn from_str_lossy(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "market" => Some(ExecutionStyle::Market),
            "maker_preferred" | "maker" => Some(ExecutionStyle::MakerPreferred),
            "maker_only" | "post_only" => Some(ExecutionStyle::MakerOnly),
            _ => None,
        }
    }
}

/// Requested size: base quantity or quote notional
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSize {
    Quantity(Quantity),
    Notional(f64),
}

/// Abstract order request handed to the exchange adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub pair: String,
    pub side: OrderSide,
    pub size: OrderSize,
    pub limit_price: Option<Price>,
    /// Attached server-side stop leg (buy side only)
    pub stop_price: Option<Price>,
    pub execution: ExecutionStyle,
}

impl OrderIntent {
    /// Buy spending roughly `cost` units of quote currency
    pub fn buy_notional(pair: &str, cost: f64) -> Result<Self, ValidationError> {
        if !cost.is_finite() || cost <= 0.0 {
            return Err(ValidationError::InvalidQuantity(format!(
                "notional must be positive, got {}",
                cost
            )));
        }
        Ok(Self::new(pair, OrderSide::Buy, OrderSize::Notional(cost)))
    }

    pub fn buy(pair: &str, quantity: f64) -> Result<Self, ValidationError> {
        Ok(Self::new(
            pair,
            OrderSide::Buy,
            OrderSize::Quantity(Quantity::new(quantity)?),
        ))
    }

    pub fn sell(pair: &str, quantity: f64) -> Result<Self, ValidationError> {
        Ok(Self::new(
            pair,
            OrderSide::Sell,
            OrderSize::Quantity(Quantity::new(quantity)?),
        ))
    }

    fn new(pair: &str, side: OrderSide, size: OrderSize) -> Self {
        Self {
            pair: pair.to_string(),
            side,
            size,
            limit_price: None,
            stop_price: None,
            execution: ExecutionStyle::Market,
        }
    }

    pub fn with_stop(mut self, stop_price: Option<f64>) -> Result<Self, ValidationError> {
        self.stop_price = stop_price.map(Price::new).transpose()?;
        Ok(self)
    }

    pub fn with_limit(mut self, limit_price: f64) -> Result<Self, ValidationError> {
        self.limit_price = Some(Price::new(limit_price)?);
        Ok(self)
    }

    pub fn with_execution(mut self, execution: ExecutionStyle) -> Self {
        self.execution = execution;
        self
    }

    pub fn base_asset(&self) -> &str {
        base_asset(&self.pair)
    }

    /// Base quantity at a reference price
    pub fn quantity_at(&self, price: f64) -> f64 {
        match self.size {
            OrderSize::Quantity(q) => q.value(),
            OrderSize::Notional(cost) => cost / price,
        }
    }
}

/// What the adapter reports back for an intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub filled_price: f64,
    pub filled_quantity: f64,
    pub failure: Option<ExchangeError>,
}

impl OrderResult {
    pub fn filled(order_id: impl Into<String>, filled_price: f64, filled_quantity: f64) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            filled_price,
            filled_quantity,
            failure: None,
        }
    }

    pub fn failed(error: ExchangeError) -> Self {
        Self {
            success: false,
            order_id: None,
            filled_price: 0.0,
            filled_quantity: 0.0,
            failure: Some(error),
        }
    }

    /// Human-readable failure reason, empty on success
    pub fn reason(&self) -> String {
        self.failure
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    pub fn filled_cost(&self) -> f64 {
        self.filled_price * self.filled_quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{PreconditionFailure, RejectionKind};

    #[test]
    fn test_buy_notional_rejects_non_positive() {
        assert!(OrderIntent::buy_notional("BTC/EUR", 0.0).is_err());
        assert!(OrderIntent::buy_notional("BTC/EUR", f64::NAN).is_err());
    }

    #[test]
    fn test_quantity_at_reference_price() {
        let intent = OrderIntent::buy_notional("ETH/EUR", 100.0).unwrap();
        assert_eq!(intent.quantity_at(2000.0), 0.05);

        let intent = OrderIntent::sell("ETH/EUR", 0.3).unwrap();
        assert_eq!(intent.quantity_at(2000.0), 0.3);
    }

    #[test]
    fn test_intent_builders() {
        let intent = OrderIntent::buy("SOL/EUR", 2.0)
            .unwrap()
            .with_stop(Some(95.0))
            .unwrap()
            .with_execution(ExecutionStyle::MakerPreferred);
        assert_eq!(intent.stop_price.unwrap().value(), 95.0);
        assert_eq!(intent.execution, ExecutionStyle::MakerPreferred);
        assert_eq!(intent.base_asset(), "SOL");
        assert!(intent.clone().with_stop(Some(-1.0)).is_err());
    }

    #[test]
    fn test_order_result_reason() {
        let ok = OrderResult::filled("OABC", 100.0, 0.5);
        assert!(ok.success);
        assert_eq!(ok.reason(), "");
        assert_eq!(ok.filled_cost(), 50.0);

        let failed = OrderResult::failed(ExchangeError::rejected(
            RejectionKind::InsufficientFunds,
            "EOrder:Insufficient funds",
        ));
        assert!(!failed.success);
        assert!(failed.reason().contains("Insufficient funds"));

        let local = OrderResult::failed(ExchangeError::Precondition(
            PreconditionFailure::SacredAsset {
                asset: "BTC".to_string(),
            },
        ));
        assert!(local.reason().contains("sacred"));
    }

    #[test]
    fn test_execution_style_parsing() {
        assert_eq!(
            ExecutionStyle::from_str_lossy("maker_only"),
            Some(ExecutionStyle::MakerOnly)
        );
        assert_eq!(
            ExecutionStyle::from_str_lossy(" Market "),
            Some(ExecutionStyle::Market)
        );
        assert_eq!(ExecutionStyle::from_str_lossy("fok"), None);
    }
}
