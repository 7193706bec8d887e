//! Crash-safe JSON files backing the risk engine.
//!
//! Three self-contained files live in the state directory:
//! - `positions.json`: open positions plus the same-day closed window
//! - `state.json`: ledger counters and the circuit-breaker latch
//! - `lifetime.json`: cumulative performance
//!
//! Each one is rewritten through a temporary file in the same directory
//! that is flushed, fsynced and renamed over the target.

use crate::domain::entities::ledger::{Ledger, LifetimeStats};
use crate::domain::entities::position::{ClosedPosition, Position};
use crate::domain::errors::PersistenceError;
use crate::domain::repositories::book_store::{BookSnapshot, BookStore};
use crate::domain::services::circuit_breaker::CircuitBreakerState;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

pub const POSITIONS_FILE: &str = "positions.json";
pub const STATE_FILE: &str = "state.json";
pub const LIFETIME_FILE: &str = "lifetime.json";

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct PositionsOut<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    open: &'a [Position],
    recent_closed: &'a [ClosedPosition],
}

#[derive(Deserialize)]
struct PositionsIn {
    #[serde(default)]
    open: Vec<Position>,
    #[serde(default)]
    recent_closed: Vec<ClosedPosition>,
}

#[derive(Serialize)]
struct StateOut<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    ledger: &'a Ledger,
    circuit_breaker: &'a CircuitBreakerState,
}

#[derive(Deserialize)]
struct StateIn {
    #[serde(default)]
    ledger: Ledger,
    #[serde(default)]
    circuit_breaker: CircuitBreakerState,
}

#[derive(Serialize)]
struct LifetimeOut<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    #[serde(flatten)]
    stats: &'a LifetimeStats,
}

#[derive(Deserialize)]
struct LifetimeIn {
    #[serde(flatten)]
    stats: LifetimeStats,
}

/// [`BookStore`] over three atomically rewritten JSON files
pub struct JsonStateStore {
    dir: PathBuf,
    /// Serializes writers sharing this store
    write_lock: Mutex<()>,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        info!("State directory: {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, PersistenceError> {
        let path = self.dir.join(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} not found, starting empty", path.display());
                return Ok(None);
            }
            Err(source) => return Err(io_error(&path, source)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PersistenceError::Serialization {
                path: path.display().to_string(),
                source,
            })
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PersistenceError> {
        let target = self.dir.join(name);
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Serialization {
                path: target.display().to_string(),
                source,
            })?;
        write_atomic(&self.dir, &target, &bytes)
    }
}

impl BookStore for JsonStateStore {
    fn load(&self) -> Result<BookSnapshot, PersistenceError> {
        let positions: Option<PositionsIn> = self.read_json(POSITIONS_FILE)?;
        let state: Option<StateIn> = self.read_json(STATE_FILE)?;
        let lifetime: Option<LifetimeIn> = self.read_json(LIFETIME_FILE)?;

        let (open, recent_closed) = positions
            .map(|p| (p.open, p.recent_closed))
            .unwrap_or_default();
        let (ledger, breaker) = state
            .map(|s| (s.ledger, s.circuit_breaker))
            .unwrap_or_default();

        Ok(BookSnapshot {
            open,
            recent_closed,
            ledger,
            breaker,
            lifetime: lifetime.map(|l| l.stats).unwrap_or_default(),
        })
    }

    fn save(&self, book: &BookSnapshot) -> Result<(), PersistenceError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let saved_at = Utc::now();

        self.write_json(
            POSITIONS_FILE,
            &PositionsOut {
                version: FORMAT_VERSION,
                saved_at,
                open: &book.open,
                recent_closed: &book.recent_closed,
            },
        )?;
        self.write_json(
            STATE_FILE,
            &StateOut {
                version: FORMAT_VERSION,
                saved_at,
                ledger: &book.ledger,
                circuit_breaker: &book.breaker,
            },
        )?;
        self.write_json(
            LIFETIME_FILE,
            &LifetimeOut {
                version: FORMAT_VERSION,
                saved_at,
                stats: &book.lifetime,
            },
        )?;
        debug!(
            "Saved {} open / {} recent closed positions",
            book.open.len(),
            book.recent_closed.len()
        );
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `target`
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp", file_name));

    let mut file = File::create(&tmp).map_err(|source| io_error(&tmp, source))?;
    file.write_all(bytes)
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_all())
        .map_err(|source| io_error(&tmp, source))?;
    drop(file);

    fs::rename(&tmp, target).map_err(|source| io_error(target, source))?;

    // make the rename itself durable
    #[cfg(unix)]
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}
