use serde::{Deserialize, Serialize};

/// Why an open position is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Position value drifting toward the venue minimum notional
    DustEscape,
    /// Held too long with only a marginal gain
    Stagnation,
    /// Fixed stop crossed
    StopLoss,
    /// Trailing stop at the given ratchet level crossed
    GoldenRatchet(u32),
    /// Rung `n` (1-based) of the fixed take-profit ladder reached
    TakeProfit(u32),
    /// Closed by the operator or the strategy layer
    Manual,
}

impl ExitReason {
    /// Stable code used in logs, events and the journal
    pub fn code(&self) -> String {
        match self {
            ExitReason::DustEscape => "DUST_ESCAPE".to_string(),
            ExitReason::Stagnation => "STAGNATION".to_string(),
            ExitReason::StopLoss => "STOP_LOSS".to_string(),
            ExitReason::GoldenRatchet(level) => format!("GOLDEN_RATCHET_L{}", level),
            ExitReason::TakeProfit(rung) => format!("TAKE_PROFIT_{}", rung),
            ExitReason::Manual => "MANUAL".to_string(),
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Result of one exit evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub should_exit: bool,
    /// Fraction of the open quantity to sell, in (0, 1]
    pub close_ratio: f64,
    pub reason: ExitReason,
}

impl ExitDecision {
    pub fn full(reason: ExitReason) -> Self {
        Self {
            should_exit: true,
            close_ratio: 1.0,
            reason,
        }
    }

    pub fn partial(reason: ExitReason, close_ratio: f64) -> Self {
        Self {
            should_exit: true,
            close_ratio: close_ratio.clamp(f64::EPSILON, 1.0),
            reason,
        }
    }

    pub fn is_full_exit(&self) -> bool {
        self.close_ratio >= 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(ExitReason::StopLoss.code(), "STOP_LOSS");
        assert_eq!(ExitReason::GoldenRatchet(1).code(), "GOLDEN_RATCHET_L1");
        assert_eq!(ExitReason::DustEscape.to_string(), "DUST_ESCAPE");
        assert_eq!(ExitReason::TakeProfit(2).code(), "TAKE_PROFIT_2");
    }

    #[test]
    fn test_partial_ratio_is_clamped() {
        let decision = ExitDecision::partial(ExitReason::TakeProfit(1), 1.5);
        assert_eq!(decision.close_ratio, 1.0);
        assert!(decision.is_full_exit());

        let decision = ExitDecision::partial(ExitReason::TakeProfit(1), 0.5);
        assert!(!decision.is_full_exit());
    }
}
