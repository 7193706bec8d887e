use crate::domain::entities::ledger::{Ledger, LifetimeStats};
use crate::domain::entities::position::{ClosedPosition, Position};
use crate::domain::errors::PersistenceError;
use crate::domain::services::circuit_breaker::CircuitBreakerState;

/// Everything the risk engine must recover after a restart
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookSnapshot {
    pub open: Vec<Position>,
    pub recent_closed: Vec<ClosedPosition>,
    pub ledger: Ledger,
    pub breaker: CircuitBreakerState,
    pub lifetime: LifetimeStats,
}

/// Durable storage for the position table and ledger.
///
/// Calls are blocking. The engine makes them from one writer thread, in the
/// order its changes happened, never while holding its book lock.
pub trait BookStore: Send + Sync {
    /// Load the last saved book; missing files yield defaults
    fn load(&self) -> Result<BookSnapshot, PersistenceError>;

    /// Atomically rewrite every file backing the book
    fn save(&self, book: &BookSnapshot) -> Result<(), PersistenceError>;
}
