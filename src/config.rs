use crate::application::services::trading_core::TradingConfig;
use crate::domain::entities::order::ExecutionStyle;
use crate::domain::services::position_manager::{ExitMode, RiskConfig, TakeProfitRung};
use crate::infrastructure::adapters::exchange_adapter::AdapterConfig;
use crate::infrastructure::kraken_client::KrakenConfig;
use crate::infrastructure::price_feed::PriceFeedConfig;
use crate::infrastructure::retry::RetryPolicy;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Everything the binary needs to wire the engine together
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub risk: RiskConfig,
    pub adapter: AdapterConfig,
    pub kraken: KrakenConfig,
    pub feed: PriceFeedConfig,
    pub trading: TradingConfig,
    /// Canonical pairs to stream and trade
    pub pairs: Vec<String>,
    pub state_dir: PathBuf,
    pub journal_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let pairs = vec!["BTC/EUR".to_string(), "ETH/EUR".to_string()];
        Self {
            risk: RiskConfig::default(),
            adapter: AdapterConfig {
                pairs: pairs.clone(),
                ..Default::default()
            },
            kraken: KrakenConfig::default(),
            feed: PriceFeedConfig {
                pairs: pairs.clone(),
                ..Default::default()
            },
            trading: TradingConfig::default(),
            pairs,
            state_dir: PathBuf::from("data"),
            journal_url: "sqlite://data/journal.db".to_string(),
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    let raw = raw.trim().to_lowercase();
    raw == "true" || raw == "1" || raw == "yes"
}

/// Comma separated list, trimmed, empties dropped
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_uppercase())
        .filter(|item| !item.is_empty())
        .collect()
}

/// `"DOGE/EUR:1.5,SHIB/EUR:2"`
fn parse_spread_ceilings(raw: &str) -> HashMap<String, f64> {
    raw.split(',')
        .filter_map(|entry| {
            let (pair, ceiling) = entry.trim().rsplit_once(':')?;
            match ceiling.trim().parse::<f64>() {
                Ok(value) if value > 0.0 => Some((pair.trim().to_uppercase(), value)),
                _ => {
                    warn!("Ignoring spread ceiling entry '{}'", entry);
                    None
                }
            }
        })
        .collect()
}

/// `"BTC,ETH;SOL,AVAX"`
fn parse_correlation_groups(raw: &str) -> Vec<Vec<String>> {
    raw.split(';')
        .map(parse_list)
        .filter(|group| !group.is_empty())
        .collect()
}

/// Reads one variable at a time so tests can feed a map instead of the
/// process environment
struct EnvReader<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    /// Parse `key`, keep `current` when it is missing, malformed or rejected
    /// by `valid`
    fn parsed<T>(&self, key: &str, current: T, valid: impl Fn(&T) -> bool) -> T
    where
        T: FromStr + Display,
        T::Err: Display,
    {
        let Some(raw) = self.raw(key) else {
            return current;
        };
        match raw.trim().parse::<T>() {
            Ok(value) if valid(&value) => value,
            Ok(value) => {
                warn!("Invalid {} value: {}, using default: {}", key, value, current);
                current
            }
            Err(e) => {
                warn!("Failed to parse {} '{}': {}, using default: {}", key, raw, e, current);
                current
            }
        }
    }

    fn flag(&self, key: &str, current: bool) -> bool {
        self.raw(key).map(|raw| parse_bool(&raw)).unwrap_or(current)
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineConfig {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineConfig {
        let env = EnvReader { lookup };
        let mut config = EngineConfig::default();

        // Risk
        let risk = &mut config.risk;
        risk.allow_averaging = env.flag("ALLOW_AVERAGING", risk.allow_averaging);
        if let Some(raw) = env.raw("EXIT_MODE") {
            match ExitMode::from_str_lossy(&raw) {
                Some(mode) => risk.exit_mode = mode,
                None => warn!("Unknown EXIT_MODE '{}', using {:?}", raw, risk.exit_mode),
            }
        }
        risk.ratchet.base_step_pct =
            env.parsed("RATCHET_BASE_STEP_PCT", risk.ratchet.base_step_pct, |v| *v > 0.0 && *v <= 20.0);
        risk.ratchet.fee_buffer_pct =
            env.parsed("FEE_BUFFER_PCT", risk.ratchet.fee_buffer_pct, |v| (0.0..=5.0).contains(v));
        if let Some(raw) = env.raw("TAKE_PROFIT_LADDER") {
            let ladder = TakeProfitRung::parse_ladder(&raw);
            if ladder.is_empty() {
                warn!("TAKE_PROFIT_LADDER '{}' has no valid rung, keeping default", raw);
            } else {
                risk.take_profit_ladder = ladder;
            }
        }
        risk.stagnation_hours = env.parsed("STAGNATION_HOURS", risk.stagnation_hours, |v| *v >= 0.0);
        risk.stagnation_min_gain_pct =
            env.parsed("STAGNATION_MIN_GAIN_PCT", risk.stagnation_min_gain_pct, |v| v.is_finite());
        risk.stagnation_max_gain_pct =
            env.parsed("STAGNATION_MAX_GAIN_PCT", risk.stagnation_max_gain_pct, |v| v.is_finite());
        if risk.stagnation_min_gain_pct > risk.stagnation_max_gain_pct {
            warn!(
                "STAGNATION_MIN_GAIN_PCT {} above STAGNATION_MAX_GAIN_PCT {}, swapping",
                risk.stagnation_min_gain_pct, risk.stagnation_max_gain_pct
            );
            std::mem::swap(&mut risk.stagnation_min_gain_pct, &mut risk.stagnation_max_gain_pct);
        }
        if let Some(raw) = env.raw("SACRED_ASSETS") {
            risk.sacred_assets = parse_list(&raw);
        }
        risk.treasure_fraction =
            env.parsed("TREASURE_FRACTION", risk.treasure_fraction, |v| (0.0..=1.0).contains(v));
        risk.recent_closed_window = env.parsed("RECENT_CLOSED_WINDOW", risk.recent_closed_window, |v| *v > 0);

        // Circuit breaker
        let breaker = &mut risk.circuit_breaker;
        breaker.enabled = env.flag("CIRCUIT_BREAKER_ENABLED", breaker.enabled);
        breaker.threshold =
            env.parsed("CIRCUIT_BREAKER_THRESHOLD", breaker.threshold, |v| (-1.0..0.0).contains(v));
        breaker.auto_recovery = env.flag("CIRCUIT_BREAKER_AUTO_RECOVERY", breaker.auto_recovery);
        breaker.recovery_threshold = env.parsed(
            "CIRCUIT_BREAKER_RECOVERY_THRESHOLD",
            breaker.recovery_threshold,
            |v| (-1.0..=0.0).contains(v),
        );
        if breaker.recovery_threshold <= breaker.threshold {
            warn!(
                "CIRCUIT_BREAKER_RECOVERY_THRESHOLD {} must sit above the trip threshold {}, disabling auto-recovery",
                breaker.recovery_threshold, breaker.threshold
            );
            breaker.auto_recovery = false;
        }

        // Exposure
        risk.exposure.max_group_exposure_pct = env.parsed(
            "MAX_GROUP_EXPOSURE_PCT",
            risk.exposure.max_group_exposure_pct,
            |v| *v > 0.0 && *v <= 1.0,
        );
        if let Some(raw) = env.raw("CORRELATION_GROUPS") {
            risk.exposure.correlation_groups = parse_correlation_groups(&raw);
        }

        // Venue and paths
        if let Some(raw) = env.raw("TRADING_PAIRS") {
            let pairs = parse_list(&raw);
            if pairs.is_empty() {
                warn!("TRADING_PAIRS is empty, keeping {:?}", config.pairs);
            } else {
                config.pairs = pairs;
            }
        }
        if let Some(url) = env.raw("KRAKEN_API_URL") {
            config.kraken.api_url = url;
        }
        if let Some(url) = env.raw("KRAKEN_WS_URL") {
            config.feed.url = url;
        }
        if let Some(dir) = env.raw("STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        config.journal_url = env
            .raw("JOURNAL_URL")
            .unwrap_or_else(|| format!("sqlite://{}", config.state_dir.join("journal.db").display()));
        config.trading.initial_capital =
            env.parsed("INITIAL_CAPITAL", config.trading.initial_capital, |v| *v > 0.0);

        // Execution
        config.trading.ghost_mode = env.flag("GHOST_MODE", config.trading.ghost_mode);
        if let Some(raw) = env.raw("EXECUTION_STYLE") {
            match ExecutionStyle::from_str_lossy(&raw) {
                Some(style) => config.trading.entry_execution = style,
                None => warn!(
                    "Unknown EXECUTION_STYLE '{}', using {:?}",
                    raw, config.trading.entry_execution
                ),
            }
        }
        let adapter = &mut config.adapter;
        adapter.default_max_spread_pct =
            env.parsed("MAX_SPREAD_PCT", adapter.default_max_spread_pct, |v| *v > 0.0);
        if let Some(raw) = env.raw("SPREAD_CEILINGS") {
            adapter.spread_ceilings = parse_spread_ceilings(&raw);
        }
        if let Some(raw) = env.raw("SPREAD_EXEMPT_PAIRS") {
            adapter.spread_exempt_pairs = parse_list(&raw).into_iter().collect();
        }
        adapter.maker_fill_polls = env.parsed("MAKER_FILL_POLLS", adapter.maker_fill_polls, |v| *v <= 60);
        adapter.sacred_assets = config.risk.sacred_assets.iter().cloned().collect::<HashSet<_>>();
        adapter.pairs = config.pairs.clone();

        let timeout_secs = env.parsed(
            "REQUEST_TIMEOUT_SECS",
            config.kraken.request_timeout.as_secs(),
            |v| (1..=120).contains(v),
        );
        config.kraken.request_timeout = Duration::from_secs(timeout_secs);
        let max_retries = env.parsed("MAX_RETRIES", config.kraken.retry.max_retries, |v| *v <= 10);
        config.kraken.retry = RetryPolicy::golden(max_retries);
        config.kraken.rate_limit.requests_per_second = env.parsed(
            "REQUESTS_PER_SECOND",
            config.kraken.rate_limit.requests_per_second,
            |v| (1..=20).contains(v),
        );

        config.feed.pairs = config.pairs.clone();
        config
    }
}
