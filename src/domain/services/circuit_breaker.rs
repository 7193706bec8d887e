use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Drawdown circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// When false the breaker never trips
    pub enabled: bool,
    /// Drawdown fraction that trips the breaker (e.g. -0.10 for -10%)
    pub threshold: f64,
    /// Clear the latch automatically once drawdown recovers
    pub auto_recovery: bool,
    /// Drawdown fraction above which auto-recovery clears the latch
    pub recovery_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: -0.10,
            auto_recovery: false,
            recovery_threshold: -0.05,
        }
    }
}

/// Persisted latch: halted flag plus the reason it tripped
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub halted: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tripped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drawdown_at_trip: Option<f64>,
}

/// Outcome of one evaluation, used to decide what to persist and announce
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerTransition {
    Unchanged,
    Tripped { reason: String, drawdown: f64 },
    Recovered { drawdown: f64 },
}

/// Fractional change from `initial` to `current`; None when undefined
pub fn drawdown(current: f64, initial: f64) -> Option<f64> {
    if !initial.is_finite() || !current.is_finite() || initial <= 0.0 {
        return None;
    }
    Some((current - initial) / initial)
}

impl CircuitBreakerState {
    /// Evaluate the latch against the current capital.
    ///
    /// Once tripped the latch stays set until [`reset`](Self::reset) or, with
    /// auto-recovery enabled, until drawdown climbs back above the recovery
    /// threshold.
    pub fn evaluate(
        &mut self,
        config: &CircuitBreakerConfig,
        current_capital: f64,
        initial_capital: f64,
        now: DateTime<Utc>,
    ) -> BreakerTransition {
        if !config.enabled {
            return BreakerTransition::Unchanged;
        }
        let Some(dd) = drawdown(current_capital, initial_capital) else {
            return BreakerTransition::Unchanged;
        };

        if self.halted {
            if config.auto_recovery && dd > config.recovery_threshold {
                self.clear();
                return BreakerTransition::Recovered { drawdown: dd };
            }
            return BreakerTransition::Unchanged;
        }

        if dd <= config.threshold {
            let reason = format!(
                "drawdown {:.2}% breached threshold {:.2}% (capital {:.2} vs initial {:.2})",
                dd * 100.0,
                config.threshold * 100.0,
                current_capital,
                initial_capital
            );
            self.halted = true;
            self.reason = reason.clone();
            self.tripped_at = Some(now);
            self.drawdown_at_trip = Some(dd);
            return BreakerTransition::Tripped {
                reason,
                drawdown: dd,
            };
        }

        BreakerTransition::Unchanged
    }

    /// Operator reset. Returns true if the latch was set.
    pub fn reset(&mut self) -> bool {
        let was_halted = self.halted;
        self.clear();
        was_halted
    }

    fn clear(&mut self) {
        self.halted = false;
        self.reason.clear();
        self.tripped_at = None;
        self.drawdown_at_trip = None;
    }
}
