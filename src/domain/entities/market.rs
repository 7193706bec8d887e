use crate::domain::entities::position::PositionSide;
use serde::{Deserialize, Serialize};

/// Balance variants the venue reports for locked or staked holdings
const BALANCE_SUFFIXES: &[&str] = &["S", "M", "F", "B", "P", "HOLD"];

/// Best bid/ask snapshot for one pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
}

impl Ticker {
    /// Price a close would fill at: longs sell into the bid, shorts buy the ask
    pub fn exit_price(&self, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => self.bid,
            PositionSide::Short => self.ask,
        }
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Bid-ask spread relative to mid, in percent
    pub fn spread_pct(&self) -> f64 {
        let mid = self.mid();
        if mid <= 0.0 {
            return f64::INFINITY;
        }
        (self.ask - self.bid) / mid * 100.0
    }
}

/// Per-pair trading constraints and fees, fetched once and cached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketLimits {
    pub pair: String,
    /// Minimum base quantity
    pub order_min: f64,
    /// Minimum quote notional
    pub cost_min: f64,
    pub price_decimals: u32,
    pub lot_decimals: u32,
    pub maker_fee_pct: f64,
    pub taker_fee_pct: f64,
}

impl MarketLimits {
    /// Describe why `quantity` at `price` is unacceptable, if it is
    pub fn check_minimums(&self, quantity: f64, price: f64) -> Option<String> {
        if quantity < self.order_min {
            return Some(format!(
                "quantity {} below minimum {}",
                quantity, self.order_min
            ));
        }
        let cost = quantity * price;
        if cost < self.cost_min {
            return Some(format!("cost {:.4} below minimum {}", cost, self.cost_min));
        }
        None
    }
}

/// Resting order as listed by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub pair: String,
    pub side: crate::domain::entities::order::OrderSide,
    pub quantity: f64,
    pub executed: f64,
}

/// Base asset of a `BASE/QUOTE` pair
pub fn base_asset(pair: &str) -> &str {
    pair.split_once('/').map(|(base, _)| base).unwrap_or(pair)
}

/// Quote asset of a `BASE/QUOTE` pair
pub fn quote_asset(pair: &str) -> &str {
    pair.split_once('/').map(|(_, quote)| quote).unwrap_or("")
}

/// Map a venue asset code to its canonical symbol.
///
/// Strips staking/locked suffixes (`DOT.S`, `ETH2.S`, `USDC.M`) and legacy
/// X/Z prefixes (`XXBT`, `ZEUR`), then applies venue aliases (`XBT` → `BTC`).
pub fn normalize_asset_code(code: &str) -> String {
    let upper = code.trim().to_uppercase();
    let stem = match upper.split_once('.') {
        Some((stem, suffix)) if BALANCE_SUFFIXES.contains(&suffix) => stem,
        _ => upper.as_str(),
    };

    let stem = match stem {
        "XXBT" | "XBT" => "BTC",
        "XXDG" | "XDG" => "DOGE",
        "XETH" | "ETH2" => "ETH",
        "XLTC" => "LTC",
        "XXRP" => "XRP",
        "XXLM" => "XLM",
        "XXMR" => "XMR",
        "XETC" => "ETC",
        "XZEC" => "ZEC",
        "XMLN" => "MLN",
        "XREP" => "REP",
        "ZEUR" => "EUR",
        "ZUSD" => "USD",
        "ZGBP" => "GBP",
        "ZCAD" => "CAD",
        "ZJPY" => "JPY",
        "ZCHF" => "CHF",
        other => other,
    };
    stem.to_string()
}

/// Venue altname for a canonical pair (`BTC/EUR` → `XBTEUR`)
pub fn venue_pair(pair: &str) -> String {
    let venue_asset = |asset: &str| match asset {
        "BTC" => "XBT".to_string(),
        "DOGE" => "XDG".to_string(),
        other => other.to_string(),
    };
    format!(
        "{}{}",
        venue_asset(base_asset(pair)),
        venue_asset(quote_asset(pair))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_price_follows_side() {
        let ticker = Ticker {
            bid: 99.5,
            ask: 100.5,
            last: 100.0,
        };
        assert_eq!(ticker.exit_price(PositionSide::Long), 99.5);
        assert_eq!(ticker.exit_price(PositionSide::Short), 100.5);
    }

    #[test]
    fn test_ticker_spread() {
        let ticker = Ticker {
            bid: 99.5,
            ask: 100.5,
            last: 100.0,
        };
        assert_eq!(ticker.mid(), 100.0);
        assert!((ticker.spread_pct() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_asset_codes() {
        assert_eq!(normalize_asset_code("XXBT"), "BTC");
        assert_eq!(normalize_asset_code("XBT.M"), "BTC");
        assert_eq!(normalize_asset_code("ZEUR"), "EUR");
        assert_eq!(normalize_asset_code("DOT.S"), "DOT");
        assert_eq!(normalize_asset_code("ETH2.S"), "ETH");
        assert_eq!(normalize_asset_code("USDC.F"), "USDC");
        assert_eq!(normalize_asset_code("XDG"), "DOGE");
        assert_eq!(normalize_asset_code("SOL"), "SOL");
        assert_eq!(normalize_asset_code("XTZ"), "XTZ");
    }

    #[test]
    fn test_pair_helpers() {
        assert_eq!(base_asset("BTC/EUR"), "BTC");
        assert_eq!(quote_asset("BTC/EUR"), "EUR");
        assert_eq!(venue_pair("BTC/EUR"), "XBTEUR");
        assert_eq!(venue_pair("DOGE/EUR"), "XDGEUR");
        assert_eq!(venue_pair("SOL/EUR"), "SOLEUR");
    }

    #[test]
    fn test_check_minimums() {
        let limits = MarketLimits {
            pair: "SOL/EUR".to_string(),
            order_min: 0.02,
            cost_min: 0.5,
            price_decimals: 2,
            lot_decimals: 8,
            maker_fee_pct: 0.25,
            taker_fee_pct: 0.4,
        };
        assert!(limits.check_minimums(0.01, 100.0).is_some());
        assert!(limits.check_minimums(0.03, 10.0).is_some());
        assert!(limits.check_minimums(0.05, 100.0).is_none());
    }
}
