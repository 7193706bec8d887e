//! Database Models
//!
//! Rows of the event journal.

use crate::domain::events::EngineEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Event record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub event_type: String,
    pub exchange: String,
    pub pair: Option<String>,
    pub details: String, // JSON string
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Decode the stored payload back into the engine event
    pub fn event(&self) -> Result<EngineEvent, serde_json::Error> {
        serde_json::from_str(&self.details)
    }
}

/// Create event input
#[derive(Debug, Clone)]
pub struct CreateEvent {
    pub event_type: String,
    pub exchange: String,
    pub pair: Option<String>,
    pub details: serde_json::Value,
}

impl CreateEvent {
    pub fn from_event(exchange: &str, event: &EngineEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: event.kind().to_string(),
            exchange: exchange.to_string(),
            pair: event.pair().map(str::to_string),
            details: serde_json::to_value(event)?,
        })
    }
}
