use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session counters and the reserved-asset ("treasure") balance.
///
/// Mutated only by the risk engine when a position (or part of one) closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub session_pnl_eur: f64,
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    /// Share of realized gains earmarked for the reserved asset
    pub treasure_eur: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<DateTime<Utc>>,
}

impl Ledger {
    /// Book one realized close. Returns the signed change in the treasure.
    ///
    /// Gains feed `fraction` of their value into the treasure; losses claw the
    /// same fraction back out, floored at zero.
    pub fn record_close(&mut self, pnl_eur: f64, fraction: f64) -> f64 {
        self.session_pnl_eur += pnl_eur;
        self.trades += 1;
        if pnl_eur > 0.0 {
            self.wins += 1;
        } else if pnl_eur < 0.0 {
            self.losses += 1;
        }

        let before = self.treasure_eur;
        self.treasure_eur = (self.treasure_eur + pnl_eur * fraction).max(0.0);
        self.treasure_eur - before
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }
}

/// Cumulative performance across every session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifetimeStats {
    pub total_pnl_eur: f64,
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub best_trade_eur: f64,
    pub worst_trade_eur: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_trade_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl LifetimeStats {
    pub fn record_close(&mut self, pnl_eur: f64, at: DateTime<Utc>) {
        self.total_pnl_eur += pnl_eur;
        self.total_trades += 1;
        if pnl_eur > 0.0 {
            self.wins += 1;
        } else if pnl_eur < 0.0 {
            self.losses += 1;
        }
        if self.total_trades == 1 {
            self.best_trade_eur = pnl_eur;
            self.worst_trade_eur = pnl_eur;
        } else {
            self.best_trade_eur = self.best_trade_eur.max(pnl_eur);
            self.worst_trade_eur = self.worst_trade_eur.min(pnl_eur);
        }
        self.first_trade_at.get_or_insert(at);
        self.last_trade_at = Some(at);
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.total_trades as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_feeds_treasure() {
        let mut ledger = Ledger::default();
        let delta = ledger.record_close(100.0, 0.1);
        assert!((delta - 10.0).abs() < 1e-9);
        assert!((ledger.treasure_eur - 10.0).abs() < 1e-9);
        assert_eq!(ledger.wins, 1);
    }

    #[test]
    fn test_loss_claws_back_treasure() {
        let mut ledger = Ledger::default();
        ledger.record_close(100.0, 0.1);
        let delta = ledger.record_close(-40.0, 0.1);
        assert!((delta + 4.0).abs() < 1e-9);
        assert!((ledger.treasure_eur - 6.0).abs() < 1e-9);
        assert!((ledger.session_pnl_eur - 60.0).abs() < 1e-9);
        assert_eq!(ledger.losses, 1);
    }

    #[test]
    fn test_treasure_never_negative() {
        let mut ledger = Ledger::default();
        ledger.record_close(10.0, 0.1);
        let delta = ledger.record_close(-500.0, 0.1);
        assert_eq!(ledger.treasure_eur, 0.0);
        assert!((delta + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_breakeven_counts_as_trade_only() {
        let mut ledger = Ledger::default();
        ledger.record_close(0.0, 0.1);
        assert_eq!(ledger.trades, 1);
        assert_eq!(ledger.wins + ledger.losses, 0);
        assert_eq!(ledger.win_rate(), 0.0);
    }

    #[test]
    fn test_lifetime_best_and_worst() {
        let mut stats = LifetimeStats::default();
        let now = Utc::now();
        stats.record_close(-5.0, now);
        stats.record_close(12.0, now);
        stats.record_close(3.0, now);
        assert_eq!(stats.best_trade_eur, 12.0);
        assert_eq!(stats.worst_trade_eur, -5.0);
        assert_eq!(stats.total_trades, 3);
        assert!((stats.win_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.first_trade_at, Some(now));
    }
}
