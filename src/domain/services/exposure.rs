//! Read-only exposure view for the strategy layer.
//!
//! The engine does not allocate capital; it only reports how much notional
//! sits in each asset and correlation group so callers can decline trades
//! that would concentrate risk.

use crate::domain::entities::market::base_asset;
use crate::domain::entities::position::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ExposureConfig {
    /// Max fraction of capital a single correlation group may hold
    pub max_group_exposure_pct: f64,
    /// Sets of base assets that move together
    pub correlation_groups: Vec<Vec<String>>,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            max_group_exposure_pct: 0.5,
            correlation_groups: vec![
                vec!["BTC".to_string(), "ETH".to_string()],
                vec!["SOL".to_string(), "AVAX".to_string()],
            ],
        }
    }
}

impl ExposureConfig {
    /// Group name (`BTC+ETH`) for an asset, or the asset itself if ungrouped
    pub fn group_of(&self, asset: &str) -> String {
        self.correlation_groups
            .iter()
            .find(|group| group.iter().any(|a| a == asset))
            .map(|group| group.join("+"))
            .unwrap_or_else(|| asset.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureReport {
    pub total_eur: f64,
    pub by_asset: BTreeMap<String, f64>,
    pub by_group: BTreeMap<String, f64>,
}

impl ExposureReport {
    /// Notional per asset and group, marked at each position's current price
    pub fn from_positions<'a>(
        positions: impl IntoIterator<Item = &'a Position>,
        config: &ExposureConfig,
    ) -> Self {
        let mut report = ExposureReport::default();
        for position in positions {
            let asset = base_asset(&position.pair);
            let notional = position.value_at(position.current_price);
            report.total_eur += notional;
            *report.by_asset.entry(asset.to_string()).or_default() += notional;
            *report.by_group.entry(config.group_of(asset)).or_default() += notional;
        }
        report
    }

    /// Describe the breach if adding `additional_eur` on `pair` would push
    /// its group above the configured share of `capital`
    pub fn would_exceed_group_limit(
        &self,
        config: &ExposureConfig,
        pair: &str,
        additional_eur: f64,
        capital: f64,
    ) -> Option<String> {
        if capital <= 0.0 {
            return None;
        }
        let group = config.group_of(base_asset(pair));
        let current = self.by_group.get(&group).copied().unwrap_or(0.0);
        let projected = current + additional_eur;
        let limit = capital * config.max_group_exposure_pct;
        if projected > limit {
            Some(format!(
                "group {} exposure {:.2} would exceed limit {:.2} ({:.0}% of {:.2})",
                group,
                projected,
                limit,
                config.max_group_exposure_pct * 100.0,
                capital
            ))
        } else {
            None
        }
    }
}
