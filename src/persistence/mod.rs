//! Persistence Layer
//!
//! Two stores with different durability needs:
//! - `state_store`: the risk engine's book as atomically rewritten JSON
//!   files, reloaded on every start
//! - `journal`: an append-only SQLite event history guarded by a
//!   single-writer lock file (`lock`)
//!
//! # Database Schema
//!
//! ## Events Table
//! - id: Serial
//! - event_type: position_opened, position_closed, ratchet_advanced, ...
//! - exchange: Venue name
//! - pair: Optional trading pair (e.g., "ETH/EUR")
//! - details: JSON payload of the event
//! - timestamp: Timestamp

pub mod journal;
pub mod lock;
pub mod models;
pub mod state_store;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Journal is open read-only")]
    ReadOnly,
}

/// Open the journal database.
///
/// # Arguments
/// - `database_url`: e.g. "sqlite://data/journal.db" or "sqlite::memory:"
/// - `read_only`: open without creating or migrating anything
pub async fn init_database(database_url: &str, read_only: bool) -> Result<DbPool, DatabaseError> {
    info!(
        "Initializing database: {}{}",
        database_url,
        if read_only { " (read-only)" } else { "" }
    );
    let in_memory = database_url.contains(":memory:");

    if !read_only {
        if let Some(db_path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(db_path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(!read_only)
        .read_only(read_only);

    // every in-memory connection is its own database
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    }
    .connect_with(options)
    .await?;

    if !read_only {
        run_migrations(&pool).await?;
    }

    info!("✓ Database initialized successfully");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            exchange TEXT NOT NULL,
            pair TEXT,
            details TEXT NOT NULL,
            timestamp DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create events table: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_pair ON events(pair)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    Ok(())
}
