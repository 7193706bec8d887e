use crate::domain::errors::ValidationError;
use crate::domain::value_objects::{price::Price, quantity::Quantity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short: multiplies raw price moves into gains
    pub fn direction(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    /// True when `candidate` is better for this side than `reference`
    pub fn is_favorable(&self, candidate: f64, reference: f64) -> bool {
        match self {
            PositionSide::Long => candidate > reference,
            PositionSide::Short => candidate < reference,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Indicator snapshot captured when the position was opened.
///
/// Known fields are typed; anything else the strategy layer sends is kept
/// verbatim in `extra` so it survives a save/load cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub indicators: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One holding, keyed by pair while open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub pair: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    /// Hard stop; never overridden by trailing logic
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub current_price: f64,
    /// High-water mark for longs, low-water mark for shorts
    pub best_price: f64,
    /// Trailing stop derived from the ratchet level
    pub virtual_stop_loss: Option<f64>,
    pub ratchet_level: Option<u32>,
    /// Rungs of the take-profit ladder already executed
    #[serde(default)]
    pub take_profit_hits: u32,
    pub status: PositionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_order_id: Option<String>,
    #[serde(default)]
    pub context: EntryContext,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        pair: &str,
        side: PositionSide,
        entry_price: f64,
        quantity: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        context: EntryContext,
        entry_time: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if pair.split_once('/').is_none() {
            return Err(ValidationError::InvalidSymbol(format!(
                "expected BASE/QUOTE, got {}",
                pair
            )));
        }
        let entry = Price::new(entry_price)?;
        let quantity = Quantity::new(quantity)?;
        let stop_loss = stop_loss.map(Price::new).transpose()?;
        let take_profit = take_profit.map(Price::new).transpose()?;

        Ok(Position {
            id: format!("{}@{}", pair, entry_time.timestamp_millis()),
            pair: pair.to_string(),
            side,
            entry_price: entry.value(),
            quantity: quantity.value(),
            entry_time,
            stop_loss: stop_loss.map(|p| p.value()),
            take_profit: take_profit.map(|p| p.value()),
            current_price: entry.value(),
            best_price: entry.value(),
            virtual_stop_loss: None,
            ratchet_level: None,
            take_profit_hits: 0,
            status: PositionStatus::Open,
            entry_order_id: None,
            context,
        })
    }

    /// Record a new market price. Returns true when the best price advanced.
    pub fn update_price(&mut self, price: f64) -> bool {
        self.current_price = price;
        if self.side.is_favorable(price, self.best_price) {
            self.best_price = price;
            return true;
        }
        false
    }

    /// Favourable move from entry to `price`, in percent
    pub fn gain_pct_at(&self, price: f64) -> f64 {
        (price - self.entry_price) / self.entry_price * 100.0 * self.side.direction()
    }

    pub fn unrealized_pnl_pct(&self) -> f64 {
        self.gain_pct_at(self.current_price)
    }

    pub fn best_gain_pct(&self) -> f64 {
        self.gain_pct_at(self.best_price)
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.entry_price) * self.quantity * self.side.direction()
    }

    pub fn value_at(&self, price: f64) -> f64 {
        self.quantity * price
    }

    pub fn hard_stop_hit(&self, price: f64) -> bool {
        match (self.stop_loss, self.side) {
            (Some(stop), PositionSide::Long) => price <= stop,
            (Some(stop), PositionSide::Short) => price >= stop,
            (None, _) => false,
        }
    }

    pub fn virtual_stop_hit(&self, price: f64) -> bool {
        match (self.virtual_stop_loss, self.side) {
            (Some(stop), PositionSide::Long) => price <= stop,
            (Some(stop), PositionSide::Short) => price >= stop,
            (None, _) => false,
        }
    }

    /// Move the virtual stop to `candidate` if that tightens it.
    /// Returns true when the stop moved.
    pub fn tighten_virtual_stop(&mut self, candidate: f64) -> bool {
        match self.virtual_stop_loss {
            Some(current) if !self.side.is_favorable(candidate, current) => false,
            _ => {
                self.virtual_stop_loss = Some(candidate);
                true
            }
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.entry_time
    }
}

/// Ledger entry for a (partially) closed position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub id: String,
    pub pair: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl_pct: f64,
    pub pnl_eur: f64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_order_id: Option<String>,
}
