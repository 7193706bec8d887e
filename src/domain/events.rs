//! Engine events for reporting and notification collaborators.
//!
//! The risk engine publishes on a broadcast channel; slow or absent
//! subscribers never block trading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PositionOpened {
        pair: String,
        side: String,
        entry_price: f64,
        quantity: f64,
        stop_loss: Option<f64>,
        at: DateTime<Utc>,
    },
    PositionClosed {
        pair: String,
        reason: String,
        exit_price: f64,
        close_ratio: f64,
        pnl_pct: f64,
        pnl_eur: f64,
        at: DateTime<Utc>,
    },
    RatchetAdvanced {
        pair: String,
        level: u32,
        virtual_stop: Option<f64>,
        best_price: f64,
        at: DateTime<Utc>,
    },
    CircuitBreakerTripped {
        reason: String,
        drawdown_pct: f64,
        at: DateTime<Utc>,
    },
    CircuitBreakerReset {
        automatic: bool,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Short event type used as the journal key
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::RatchetAdvanced { .. } => "ratchet_advanced",
            EngineEvent::CircuitBreakerTripped { .. } => "circuit_breaker_tripped",
            EngineEvent::CircuitBreakerReset { .. } => "circuit_breaker_reset",
        }
    }

    pub fn pair(&self) -> Option<&str> {
        match self {
            EngineEvent::PositionOpened { pair, .. }
            | EngineEvent::PositionClosed { pair, .. }
            | EngineEvent::RatchetAdvanced { pair, .. } => Some(pair),
            _ => None,
        }
    }
}

/// Fan-out handle shared by the engine and its subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish to current subscribers; no subscribers is not an error
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::CircuitBreakerReset {
            automatic: false,
            at: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "circuit_breaker_reset");
        assert_eq!(event.pair(), None);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::RatchetAdvanced {
            pair: "BTC/EUR".to_string(),
            level: 2,
            virtual_stop: Some(101.8),
            best_price: 103.0,
            at: Utc::now(),
        });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = EngineEvent::PositionClosed {
            pair: "ETH/EUR".to_string(),
            reason: "STOP_LOSS".to_string(),
            exit_price: 94.0,
            close_ratio: 1.0,
            pnl_pct: -6.0,
            pnl_eur: -6.0,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "position_closed");
        assert_eq!(json["reason"], "STOP_LOSS");
    }
}
