use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure at the exchange adapter boundary.
///
/// Every public adapter method resolves to either a value or exactly one of
/// these variants; nothing else crosses the boundary.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum ExchangeError {
    /// Network, timeout or service-unavailable failure that survived every retry
    #[error("Transport failure after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },

    /// The venue answered and refused the request
    #[error("Rejected by venue ({kind}): {reason}")]
    Rejected { kind: RejectionKind, reason: String },

    /// Refused locally before any network call
    #[error("Precondition failed: {0}")]
    Precondition(PreconditionFailure),
}

impl ExchangeError {
    pub fn transport(attempts: u32, message: impl Into<String>) -> Self {
        ExchangeError::Transport {
            attempts,
            message: message.into(),
        }
    }

    pub fn rejected(kind: RejectionKind, reason: impl Into<String>) -> Self {
        ExchangeError::Rejected {
            kind,
            reason: reason.into(),
        }
    }

    /// Transient failures the retry policy is allowed to repeat
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transport { .. })
    }

    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            ExchangeError::Rejected {
                kind: RejectionKind::InsufficientFunds,
                ..
            }
        )
    }

    /// Short error code for logging/monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            ExchangeError::Transport { .. } => "ERR_TRANSPORT",
            ExchangeError::Rejected { kind, .. } => kind.error_code(),
            ExchangeError::Precondition(_) => "ERR_PRECONDITION",
        }
    }
}

/// Categories of venue-side refusals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    InsufficientFunds,
    InvalidOrder,
    RateLimited,
    Authentication,
    InvalidNonce,
    PostOnlyWouldTake,
    UnknownOrder,
    Other,
}

impl RejectionKind {
    /// Map a Kraken-style error string (`EOrder:Insufficient funds`) to a kind
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("insufficient funds") {
            RejectionKind::InsufficientFunds
        } else if lower.contains("invalid nonce") {
            RejectionKind::InvalidNonce
        } else if lower.contains("rate limit") || lower.contains("too many requests") {
            RejectionKind::RateLimited
        } else if lower.contains("invalid key")
            || lower.contains("invalid signature")
            || lower.contains("permission denied")
        {
            RejectionKind::Authentication
        } else if lower.contains("post only") {
            RejectionKind::PostOnlyWouldTake
        } else if lower.contains("unknown order") {
            RejectionKind::UnknownOrder
        } else if lower.starts_with("eorder") || lower.contains("invalid arguments") {
            RejectionKind::InvalidOrder
        } else {
            RejectionKind::Other
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            RejectionKind::InsufficientFunds => "ERR_INSUFFICIENT_FUNDS",
            RejectionKind::InvalidOrder => "ERR_INVALID_ORDER",
            RejectionKind::RateLimited => "ERR_RATE_LIMITED",
            RejectionKind::Authentication => "ERR_AUTH",
            RejectionKind::InvalidNonce => "ERR_INVALID_NONCE",
            RejectionKind::PostOnlyWouldTake => "ERR_POST_ONLY",
            RejectionKind::UnknownOrder => "ERR_UNKNOWN_ORDER",
            RejectionKind::Other => "ERR_REJECTED",
        }
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RejectionKind::InsufficientFunds => "insufficient funds",
            RejectionKind::InvalidOrder => "invalid order",
            RejectionKind::RateLimited => "rate limited",
            RejectionKind::Authentication => "authentication",
            RejectionKind::InvalidNonce => "invalid nonce",
            RejectionKind::PostOnlyWouldTake => "post-only would take liquidity",
            RejectionKind::UnknownOrder => "unknown order",
            RejectionKind::Other => "other",
        };
        write!(f, "{}", label)
    }
}

/// Local checks that stop an order before it reaches the network
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum PreconditionFailure {
    #[error("spread {spread_pct:.3}% on {pair} exceeds ceiling {ceiling_pct:.3}%")]
    SpreadTooWide {
        pair: String,
        spread_pct: f64,
        ceiling_pct: f64,
    },

    #[error("order on {pair} below venue minimum: {detail}")]
    BelowMinimum { pair: String, detail: String },

    #[error("{asset} is a sacred asset and cannot be sold")]
    SacredAsset { asset: String },

    #[error("unknown pair: {0}")]
    UnknownPair(String),

    #[error("invalid order intent: {0}")]
    InvalidIntent(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Value must be finite")]
    MustBeFinite,
}

impl From<ValidationError> for String {
    fn from(error: ValidationError) -> Self {
        error.to_string()
    }
}

/// Disk persistence failure. The engine logs these and keeps its in-memory state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error for {path}: {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by the trading core to the strategy layer
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TradeError {
    #[error("Trading halted by circuit breaker: {0}")]
    Halted(String),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Order not filled: {0}")]
    NotFilled(String),

    #[error("No open position for {0}")]
    NoPosition(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Exposure limit: {0}")]
    ExposureLimit(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_kraken_errors() {
        assert_eq!(
            RejectionKind::classify("EOrder:Insufficient funds"),
            RejectionKind::InsufficientFunds
        );
        assert_eq!(
            RejectionKind::classify("EAPI:Invalid nonce"),
            RejectionKind::InvalidNonce
        );
        assert_eq!(
            RejectionKind::classify("EAPI:Rate limit exceeded"),
            RejectionKind::RateLimited
        );
        assert_eq!(
            RejectionKind::classify("EAPI:Invalid key"),
            RejectionKind::Authentication
        );
        assert_eq!(
            RejectionKind::classify("EOrder:Post only order"),
            RejectionKind::PostOnlyWouldTake
        );
        assert_eq!(
            RejectionKind::classify("EOrder:Order minimum not met"),
            RejectionKind::InvalidOrder
        );
        assert_eq!(
            RejectionKind::classify("EGeneral:Invalid arguments"),
            RejectionKind::InvalidOrder
        );
        assert_eq!(RejectionKind::classify("EFoo:Bar"), RejectionKind::Other);
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(ExchangeError::transport(5, "timeout").is_retryable());
        assert!(!ExchangeError::rejected(RejectionKind::InvalidOrder, "bad").is_retryable());
        assert!(!ExchangeError::Precondition(PreconditionFailure::UnknownPair(
            "FOO/EUR".to_string()
        ))
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let error = ExchangeError::Precondition(PreconditionFailure::SpreadTooWide {
            pair: "BTC/EUR".to_string(),
            spread_pct: 0.75,
            ceiling_pct: 0.5,
        });
        assert_eq!(
            error.to_string(),
            "Precondition failed: spread 0.750% on BTC/EUR exceeds ceiling 0.500%"
        );
        assert_eq!(error.error_code(), "ERR_PRECONDITION");
    }
}
