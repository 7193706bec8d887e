//! Golden-ratio trailing stop ("ratchet").
//!
//! Gain thresholds grow geometrically: `step(n) = base × φⁿ` percent. The
//! ratchet level is the highest `n` whose threshold the best (net) gain has
//! reached, and the virtual stop locks the gain of the rung *below* it:
//!
//! | level | virtual stop                          |
//! |-------|---------------------------------------|
//! | none  | none                                  |
//! | 0     | none (let the position breathe)       |
//! | 1     | entry ± fee buffer (break-even)       |
//! | n ≥ 2 | entry ± (step(n−1) + fee buffer)      |

use crate::domain::entities::position::{Position, PositionSide};

pub const PHI: f64 = 1.618_033_988_749_895;

/// Upper bound on the level search
pub const MAX_RATCHET_LEVEL: u32 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct GoldenRatchet {
    /// `step(0)`, in percent
    pub base_step_pct: f64,
    /// Round-trip fee estimate, in percent
    pub fee_buffer_pct: f64,
}

impl Default for GoldenRatchet {
    fn default() -> Self {
        Self {
            base_step_pct: 1.0,
            fee_buffer_pct: 0.2,
        }
    }
}

/// Level and stop the ratchet wants for a position right now
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatchetTarget {
    pub level: Option<u32>,
    pub virtual_stop: Option<f64>,
}

impl GoldenRatchet {
    pub fn step(&self, n: u32) -> f64 {
        self.base_step_pct * PHI.powi(n as i32)
    }

    /// Gain after the fee buffer is paid
    pub fn net_gain_pct(&self, gross_gain_pct: f64) -> f64 {
        gross_gain_pct - self.fee_buffer_pct
    }

    /// Highest `n` with `net_gain ≥ step(n)`, or None below `step(0)`
    pub fn level_for(&self, net_gain_pct: f64) -> Option<u32> {
        if !net_gain_pct.is_finite() || net_gain_pct < self.step(0) {
            return None;
        }
        let mut level = 0;
        while level < MAX_RATCHET_LEVEL && net_gain_pct >= self.step(level + 1) {
            level += 1;
        }
        Some(level)
    }

    /// Virtual stop price for `level` on a position entered at `entry`
    pub fn stop_for_level(&self, entry: f64, side: PositionSide, level: u32) -> Option<f64> {
        let locked_pct = match level {
            0 => return None,
            1 => self.fee_buffer_pct,
            n => self.step(n - 1) + self.fee_buffer_pct,
        };
        Some(entry * (1.0 + side.direction() * locked_pct / 100.0))
    }

    /// Level and stop derived from the position's best price
    pub fn target_for(&self, position: &Position) -> RatchetTarget {
        let level = self.level_for(self.net_gain_pct(position.best_gain_pct()));
        let virtual_stop =
            level.and_then(|l| self.stop_for_level(position.entry_price, position.side, l));
        RatchetTarget {
            level,
            virtual_stop,
        }
    }

    /// Apply the target to `position` without ever lowering the level or
    /// loosening the stop. Returns the new level when it advanced.
    pub fn advance(&self, position: &mut Position) -> Option<u32> {
        let target = self.target_for(position);
        let advanced = match (target.level, position.ratchet_level) {
            (Some(new), Some(old)) if new > old => Some(new),
            (Some(new), None) => Some(new),
            _ => None,
        };
        if let Some(level) = advanced {
            position.ratchet_level = Some(level);
        }
        if let Some(stop) = target.virtual_stop {
            position.tighten_virtual_stop(stop);
        }
        advanced
    }
}
