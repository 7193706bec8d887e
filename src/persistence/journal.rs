//! Event Journal
//!
//! Append-only SQLite record of every engine event, the historical store
//! behind reporting. Opened read-only when another process owns the
//! history lock.

use super::models::{CreateEvent, EventRecord};
use super::{DatabaseError, DbPool};
use crate::domain::events::EngineEvent;
use chrono::Utc;
use tracing::{debug, error};

pub struct EventJournal {
    pool: DbPool,
    exchange: String,
    read_only: bool,
}

impl EventJournal {
    pub fn new(pool: DbPool, exchange: &str, read_only: bool) -> Self {
        Self {
            pool,
            exchange: exchange.to_string(),
            read_only,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Append one engine event
    pub async fn record(&self, event: &EngineEvent) -> Result<EventRecord, DatabaseError> {
        let create = CreateEvent::from_event(&self.exchange, event).map_err(|e| {
            DatabaseError::QueryError(format!("Failed to serialize event: {}", e))
        })?;
        self.create(create).await
    }

    pub async fn create(&self, event: CreateEvent) -> Result<EventRecord, DatabaseError> {
        if self.read_only {
            return Err(DatabaseError::ReadOnly);
        }
        let details_json = serde_json::to_string(&event.details)
            .map_err(|e| DatabaseError::QueryError(format!("Failed to serialize details: {}", e)))?;

        let record = sqlx::query_as::<_, EventRecord>(
            r#"
            INSERT INTO events (event_type, exchange, pair, details, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING *
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.exchange)
        .bind(&event.pair)
        .bind(&details_json)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record event: {}", e);
            DatabaseError::QueryError(format!("Failed to record event: {}", e))
        })?;

        debug!("Journaled {} #{}", record.event_type, record.id);
        Ok(record)
    }

    /// Most recent events first
    pub async fn recent(&self, limit: i64) -> Result<Vec<EventRecord>, DatabaseError> {
        sqlx::query_as::<_, EventRecord>(
            "SELECT * FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get recent events: {}", e);
            DatabaseError::QueryError(format!("Failed to get events: {}", e))
        })
    }

    pub async fn by_event_type(
        &self,
        event_type: &str,
        limit: i64,
    ) -> Result<Vec<EventRecord>, DatabaseError> {
        sqlx::query_as::<_, EventRecord>(
            "SELECT * FROM events WHERE event_type = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )
        .bind(event_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get events of type {}: {}", event_type, e);
            DatabaseError::QueryError(format!("Failed to get events: {}", e))
        })
    }

    pub async fn by_pair(&self, pair: &str, limit: i64) -> Result<Vec<EventRecord>, DatabaseError> {
        sqlx::query_as::<_, EventRecord>(
            "SELECT * FROM events WHERE pair = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )
        .bind(pair)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get events for {}: {}", pair, e);
            DatabaseError::QueryError(format!("Failed to get events: {}", e))
        })
    }
}
