//! Smart execution on top of a [`VenueApi`].
//!
//! The adapter turns abstract [`OrderIntent`]s into venue orders: spread
//! gate, cached market limits, post-only at the touch with market fallback,
//! attached stop legs and insufficient-funds recovery for sells. Every
//! failure comes back as an [`ExchangeError`] value, never a panic.

use crate::domain::entities::market::{base_asset, MarketLimits, OpenOrder, Ticker};
use crate::domain::entities::order::{ExecutionStyle, OrderIntent, OrderResult, OrderSide};
use crate::domain::errors::{ExchangeError, PreconditionFailure, RejectionKind};
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeResult};
use crate::domain::value_objects::{price::Price, quantity::Quantity};
use crate::infrastructure::venue::{OrderFill, OrderState, VenueApi, VenueOrder};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Consecutive transport failures after which the adapter reports unhealthy
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// Polls spent confirming a market order before assuming it filled
const MARKET_CONFIRM_POLLS: u32 = 5;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub venue_name: String,
    /// Pairs whose limits are fetched on connect
    pub pairs: Vec<String>,
    pub default_max_spread_pct: f64,
    /// Per-pair spread ceilings overriding the default
    pub spread_ceilings: HashMap<String, f64>,
    /// Pairs traded without any spread check
    pub spread_exempt_pairs: HashSet<String>,
    pub sacred_assets: HashSet<String>,
    /// Status polls a resting maker order gets before it is cancelled
    pub maker_fill_polls: u32,
    pub fill_poll_interval: Duration,
    /// Smallest fraction of the requested volume a sell may be resized to
    pub resize_tolerance: f64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            venue_name: "kraken".to_string(),
            pairs: Vec::new(),
            default_max_spread_pct: 0.5,
            spread_ceilings: HashMap::new(),
            spread_exempt_pairs: HashSet::new(),
            sacred_assets: ["BTC".to_string()].into_iter().collect(),
            maker_fill_polls: 3,
            fill_poll_interval: Duration::from_secs(2),
            resize_tolerance: 0.99,
        }
    }
}

impl AdapterConfig {
    /// Spread ceiling for `pair`, or `None` when the pair is exempt
    pub fn spread_ceiling(&self, pair: &str) -> Option<f64> {
        if self.spread_exempt_pairs.contains(pair) {
            return None;
        }
        Some(
            self.spread_ceilings
                .get(pair)
                .copied()
                .unwrap_or(self.default_max_spread_pct),
        )
    }
}

pub struct ExchangeAdapter<V: VenueApi> {
    venue: Arc<V>,
    config: AdapterConfig,
    limits: RwLock<HashMap<String, MarketLimits>>,
    connected: AtomicBool,
    transport_failures: AtomicU32,
}

impl<V: VenueApi> ExchangeAdapter<V> {
    pub fn new(venue: Arc<V>, config: AdapterConfig) -> Self {
        Self {
            venue,
            config,
            limits: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            transport_failures: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn track<T>(&self, result: ExchangeResult<T>) -> ExchangeResult<T> {
        match &result {
            Ok(_) => self.transport_failures.store(0, Ordering::Relaxed),
            Err(ExchangeError::Transport { .. }) => {
                self.transport_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
        result
    }

    fn check_spread(&self, pair: &str, ticker: &Ticker) -> ExchangeResult<()> {
        let Some(ceiling) = self.config.spread_ceiling(pair) else {
            return Ok(());
        };
        let spread = ticker.spread_pct();
        if spread > ceiling {
            return Err(ExchangeError::Precondition(
                PreconditionFailure::SpreadTooWide {
                    pair: pair.to_string(),
                    spread_pct: spread,
                    ceiling_pct: ceiling,
                },
            ));
        }
        Ok(())
    }

    async fn execute(&self, intent: &OrderIntent) -> ExchangeResult<OrderResult> {
        let pair = intent.pair.as_str();
        let asset = intent.base_asset();
        if intent.side == OrderSide::Sell && self.config.sacred_assets.contains(asset) {
            return Err(ExchangeError::Precondition(
                PreconditionFailure::SacredAsset {
                    asset: asset.to_string(),
                },
            ));
        }

        let limits = self.get_limits(pair).await?;
        let ticker = self.get_ticker(pair).await?;
        self.check_spread(pair, &ticker)?;

        let reference = match intent.side {
            OrderSide::Buy => ticker.ask,
            OrderSide::Sell => ticker.bid,
        };
        if !reference.is_finite() || reference <= 0.0 {
            return Err(ExchangeError::Precondition(
                PreconditionFailure::InvalidIntent(format!(
                    "no usable {} price for {}",
                    intent.side, pair
                )),
            ));
        }

        let volume = Quantity::new(intent.quantity_at(reference))
            .map_err(|e| {
                ExchangeError::Precondition(PreconditionFailure::InvalidIntent(e.to_string()))
            })?
            .floor_to(limits.lot_decimals);
        if let Some(detail) = limits.check_minimums(volume, reference) {
            return Err(ExchangeError::Precondition(
                PreconditionFailure::BelowMinimum {
                    pair: pair.to_string(),
                    detail,
                },
            ));
        }

        // the server-side safety net only makes sense on the opening leg
        let stop = match intent.side {
            OrderSide::Buy => intent
                .stop_price
                .map(|p| p.round_to(limits.price_decimals)),
            OrderSide::Sell => None,
        };

        debug!(
            "{} {} {} @ ~{} ({:?}, stop {:?})",
            intent.side, volume, pair, reference, intent.execution, stop
        );

        match intent.execution {
            ExecutionStyle::Market => {
                self.execute_market(pair, intent.side, volume, stop, reference, &limits)
                    .await
            }
            ExecutionStyle::MakerPreferred | ExecutionStyle::MakerOnly => {
                self.execute_maker(intent, &ticker, volume, stop, reference, &limits)
                    .await
            }
        }
    }

    async fn execute_market(
        &self,
        pair: &str,
        side: OrderSide,
        volume: f64,
        stop: Option<f64>,
        reference: f64,
        limits: &MarketLimits,
    ) -> ExchangeResult<OrderResult> {
        let order = VenueOrder::market(pair, side, volume, limits).with_stop(stop);
        let (txid, volume) = self.submit(order).await?;
        let fill = self.confirm_fill(&txid, volume, reference).await?;
        info!(
            "Market {} {} {} filled: {} @ {}",
            side, pair, txid, fill.executed, fill.avg_price
        );
        Ok(OrderResult::filled(txid, fill.avg_price, fill.executed))
    }

    async fn execute_maker(
        &self,
        intent: &OrderIntent,
        ticker: &Ticker,
        volume: f64,
        stop: Option<f64>,
        reference: f64,
        limits: &MarketLimits,
    ) -> ExchangeResult<OrderResult> {
        let pair = intent.pair.as_str();
        let side = intent.side;
        let maker_only = intent.execution == ExecutionStyle::MakerOnly;

        let touch = match (intent.limit_price, side) {
            (Some(price), _) => price,
            (None, OrderSide::Buy) => price_of(ticker.bid)?,
            (None, OrderSide::Sell) => price_of(ticker.ask)?,
        };
        let price = touch.round_to(limits.price_decimals);
        let order =
            VenueOrder::post_only_limit(pair, side, volume, price, limits).with_stop(stop);

        let txid = match self.submit(order).await {
            Ok((txid, _)) => txid,
            Err(ExchangeError::Rejected {
                kind: RejectionKind::PostOnlyWouldTake,
                reason,
            }) => {
                if maker_only {
                    info!("Post-only {} {} rejected, not taking liquidity", side, pair);
                    return Ok(OrderResult::failed(ExchangeError::rejected(
                        RejectionKind::PostOnlyWouldTake,
                        reason,
                    )));
                }
                info!("Post-only {} {} rejected, falling back to market", side, pair);
                return self
                    .execute_market(pair, side, volume, stop, reference, limits)
                    .await;
            }
            Err(e) => return Err(e),
        };

        let mut last_seen: Option<OrderFill> = None;
        for _ in 0..self.config.maker_fill_polls {
            sleep(self.config.fill_poll_interval).await;
            match self.venue.query_order(&txid).await {
                Ok(fill) if fill.state == OrderState::Closed => {
                    let avg = if fill.avg_price > 0.0 { fill.avg_price } else { price };
                    info!("Maker {} {} {} filled: {} @ {}", side, pair, txid, fill.executed, avg);
                    return Ok(OrderResult::filled(txid, avg, fill.executed));
                }
                Ok(fill) if fill.state.is_final() => {
                    last_seen = Some(fill);
                    break;
                }
                Ok(fill) => last_seen = Some(fill),
                Err(e) => warn!("Could not poll maker order {}: {}", txid, e),
            }
        }

        if !last_seen.as_ref().is_some_and(|f| f.state.is_final()) {
            if let Err(e) = self.venue.cancel_order(&txid).await {
                warn!("Could not cancel unfilled maker order {}: {}", txid, e);
            }
        }
        let made = match self.venue.query_order(&txid).await {
            Ok(fill) => Some(fill),
            Err(e) => {
                warn!("Could not re-query maker order {}: {}", txid, e);
                last_seen
            }
        }
        .filter(|f| f.executed > 0.0);
        let made_qty = made.as_ref().map(|f| f.executed).unwrap_or(0.0);
        let made_price = made
            .as_ref()
            .map(|f| if f.avg_price > 0.0 { f.avg_price } else { price })
            .unwrap_or(price);

        let remainder = Quantity::new(volume - made_qty)
            .map(|q| q.floor_to(limits.lot_decimals))
            .unwrap_or(0.0);
        let remainder_tradeable =
            remainder > 0.0 && limits.check_minimums(remainder, reference).is_none();

        if maker_only || !remainder_tradeable {
            if made_qty > 0.0 {
                return Ok(OrderResult::filled(txid, made_price, made_qty));
            }
            return Ok(OrderResult::failed(ExchangeError::rejected(
                RejectionKind::Other,
                format!(
                    "post-only order {} not filled after {} polls",
                    txid, self.config.maker_fill_polls
                ),
            )));
        }

        info!(
            "Maker {} {} filled {}/{}, sending {} at market",
            side, pair, made_qty, volume, remainder
        );
        match self
            .execute_market(pair, side, remainder, stop, reference, limits)
            .await
        {
            Ok(taker) if taker.success => {
                let total = made_qty + taker.filled_quantity;
                let avg = (made_qty * made_price + taker.filled_cost()) / total;
                let order_id = taker.order_id.unwrap_or(txid);
                Ok(OrderResult::filled(order_id, avg, total))
            }
            Ok(_) | Err(_) if made_qty > 0.0 => {
                warn!(
                    "Market remainder on {} failed, keeping maker fill of {}",
                    pair, made_qty
                );
                Ok(OrderResult::filled(txid, made_price, made_qty))
            }
            other => other,
        }
    }

    /// Submit, recovering once from an insufficient-funds sell.
    /// Returns the order id and the volume actually submitted.
    async fn submit(&self, order: VenueOrder) -> ExchangeResult<(String, f64)> {
        match self.track(self.venue.add_order(&order).await) {
            Ok(txid) => Ok((txid, order.volume)),
            Err(e) if e.is_insufficient_funds() && order.side == OrderSide::Sell => {
                self.recover_insufficient_funds(order, e).await
            }
            Err(e) => Err(e),
        }
    }

    async fn recover_insufficient_funds(
        &self,
        order: VenueOrder,
        original: ExchangeError,
    ) -> ExchangeResult<(String, f64)> {
        warn!(
            "Insufficient funds selling {} {}, attempting recovery",
            order.volume, order.pair
        );

        let resting = match self.open_orders(Some(&order.pair)).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("Could not list open orders on {}: {}", order.pair, e);
                Vec::new()
            }
        };
        if !resting.is_empty() {
            for resting_order in &resting {
                if let Err(e) = self.venue.cancel_order(&resting_order.order_id).await {
                    warn!("Could not cancel {}: {}", resting_order.order_id, e);
                }
            }
            info!(
                "Cancelled {} resting order(s) on {}, retrying sell",
                resting.len(),
                order.pair
            );
            match self.venue.add_order(&order).await {
                Ok(txid) => return Ok((txid, order.volume)),
                Err(e) if e.is_insufficient_funds() => {}
                Err(e) => return Err(e),
            }
        }

        let asset = base_asset(&order.pair);
        let available = match self.venue.free_balances().await {
            Ok(balances) => balances.get(asset).copied().unwrap_or(0.0),
            Err(e) => {
                warn!("Could not read free balance for {}: {}", asset, e);
                return Err(original);
            }
        };
        let resized = Quantity::new(available)
            .map(|q| q.floor_to(order.lot_decimals))
            .unwrap_or(0.0);
        if resized > 0.0
            && resized < order.volume
            && resized >= order.volume * self.config.resize_tolerance
        {
            warn!(
                "Resizing {} sell from {} to free balance {}",
                order.pair, order.volume, resized
            );
            let txid = self.venue.add_order(&order.with_volume(resized)).await?;
            return Ok((txid, resized));
        }

        warn!(
            "Free {} balance {} too far from requested {}, giving up",
            asset, available, order.volume
        );
        Err(original)
    }

    /// Wait for a market order to close. A failed status query is not a
    /// failed order: the fill is assumed at the reference price.
    async fn confirm_fill(
        &self,
        txid: &str,
        volume: f64,
        reference: f64,
    ) -> ExchangeResult<OrderFill> {
        let assumed = || OrderFill {
            order_id: txid.to_string(),
            state: OrderState::Closed,
            volume,
            executed: volume,
            avg_price: reference,
        };

        for poll in 0..MARKET_CONFIRM_POLLS {
            match self.venue.query_order(txid).await {
                Ok(mut fill) if fill.state.is_final() => {
                    if fill.executed <= 0.0 {
                        return Err(ExchangeError::rejected(
                            RejectionKind::Other,
                            format!("order {} ended {:?} without a fill", txid, fill.state),
                        ));
                    }
                    if fill.avg_price <= 0.0 {
                        fill.avg_price = reference;
                    }
                    return Ok(fill);
                }
                Ok(_) => {
                    debug!("Order {} not closed yet (poll {})", txid, poll + 1);
                    sleep(self.config.fill_poll_interval).await;
                }
                Err(e) => {
                    warn!(
                        "Could not confirm {}: {}. Assuming fill at {}",
                        txid, e, reference
                    );
                    return Ok(assumed());
                }
            }
        }

        warn!(
            "Order {} still open after {} polls. Assuming fill at {}",
            txid, MARKET_CONFIRM_POLLS, reference
        );
        Ok(assumed())
    }
}

fn price_of(value: f64) -> ExchangeResult<Price> {
    Price::new(value).map_err(|e| {
        ExchangeError::Precondition(PreconditionFailure::InvalidIntent(e.to_string()))
    })
}

#[async_trait]
impl<V: VenueApi> ExchangeClient for ExchangeAdapter<V> {
    fn name(&self) -> &str {
        &self.config.venue_name
    }

    async fn connect(&self) -> ExchangeResult<()> {
        let offset = self.track(self.venue.sync_clock().await)?;
        info!(
            "Connected to {} (clock offset {} ms)",
            self.config.venue_name, offset
        );
        for pair in &self.config.pairs {
            if let Err(e) = self.get_limits(pair).await {
                warn!("Could not load limits for {}: {}", pair, e);
            }
        }
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn get_ticker(&self, pair: &str) -> ExchangeResult<Ticker> {
        self.track(self.venue.ticker(pair).await)
    }

    async fn get_balance(&self) -> ExchangeResult<HashMap<String, f64>> {
        self.track(self.venue.free_balances().await)
    }

    async fn get_limits(&self, pair: &str) -> ExchangeResult<MarketLimits> {
        if let Some(limits) = self.limits.read().await.get(pair) {
            return Ok(limits.clone());
        }
        let limits = self.track(self.venue.asset_pair(pair).await)?;
        debug!("Cached limits for {}: {:?}", pair, limits);
        self.limits
            .write()
            .await
            .insert(pair.to_string(), limits.clone());
        Ok(limits)
    }

    async fn place_order(&self, intent: &OrderIntent) -> OrderResult {
        match self.execute(intent).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "{} {} failed [{}]: {}",
                    intent.side,
                    intent.pair,
                    e.error_code(),
                    e
                );
                OrderResult::failed(e)
            }
        }
    }

    async fn cancel(&self, order_id: &str) -> ExchangeResult<()> {
        self.track(self.venue.cancel_order(order_id).await)
    }

    async fn open_orders(&self, pair: Option<&str>) -> ExchangeResult<Vec<OpenOrder>> {
        let orders = self.track(self.venue.open_orders().await)?;
        Ok(match pair {
            Some(pair) => orders.into_iter().filter(|o| o.pair == pair).collect(),
            None => orders,
        })
    }

    async fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
            && self.transport_failures.load(Ordering::Relaxed) < UNHEALTHY_AFTER_FAILURES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderType;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted venue recording every call
    #[derive(Default)]
    struct MockVenue {
        ticker: Mutex<Option<Ticker>>,
        add_results: Mutex<VecDeque<ExchangeResult<String>>>,
        query_results: Mutex<VecDeque<ExchangeResult<OrderFill>>>,
        free: Mutex<HashMap<String, f64>>,
        resting: Mutex<Vec<OpenOrder>>,
        submitted: Mutex<Vec<VenueOrder>>,
        cancelled: Mutex<Vec<String>>,
        asset_pair_calls: AtomicU32,
    }

    impl MockVenue {
        fn with_ticker(bid: f64, ask: f64) -> Self {
            let venue = Self::default();
            *venue.ticker.lock().unwrap() = Some(Ticker { bid, ask, last: bid });
            venue
        }

        fn push_add(&self, result: ExchangeResult<String>) {
            self.add_results.lock().unwrap().push_back(result);
        }

        fn push_query(&self, fill: OrderFill) {
            self.query_results.lock().unwrap().push_back(Ok(fill));
        }

        fn submitted(&self) -> Vec<VenueOrder> {
            self.submitted.lock().unwrap().clone()
        }
    }

    fn fill(id: &str, state: OrderState, volume: f64, executed: f64, price: f64) -> OrderFill {
        OrderFill {
            order_id: id.to_string(),
            state,
            volume,
            executed,
            avg_price: price,
        }
    }

    fn insufficient() -> ExchangeError {
        ExchangeError::rejected(RejectionKind::InsufficientFunds, "EOrder:Insufficient funds")
    }

    #[async_trait]
    impl VenueApi for MockVenue {
        async fn sync_clock(&self) -> ExchangeResult<i64> {
            Ok(0)
        }

        async fn ticker(&self, _pair: &str) -> ExchangeResult<Ticker> {
            let ticker = *self.ticker.lock().unwrap();
            ticker.ok_or_else(|| ExchangeError::transport(1, "no ticker"))
        }

        async fn asset_pair(&self, pair: &str) -> ExchangeResult<MarketLimits> {
            self.asset_pair_calls.fetch_add(1, Ordering::SeqCst);
            Ok(MarketLimits {
                pair: pair.to_string(),
                order_min: 0.01,
                cost_min: 5.0,
                price_decimals: 2,
                lot_decimals: 4,
                maker_fee_pct: 0.16,
                taker_fee_pct: 0.26,
            })
        }

        async fn balances(&self) -> ExchangeResult<HashMap<String, f64>> {
            Ok(self.free.lock().unwrap().clone())
        }

        async fn free_balances(&self) -> ExchangeResult<HashMap<String, f64>> {
            Ok(self.free.lock().unwrap().clone())
        }

        async fn add_order(&self, order: &VenueOrder) -> ExchangeResult<String> {
            self.submitted.lock().unwrap().push(order.clone());
            let n = self.submitted.lock().unwrap().len();
            self.add_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("O-{}", n)))
        }

        async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
            self.cancelled.lock().unwrap().push(order_id.to_string());
            self.resting.lock().unwrap().retain(|o| o.order_id != order_id);
            Ok(())
        }

        async fn open_orders(&self) -> ExchangeResult<Vec<OpenOrder>> {
            Ok(self.resting.lock().unwrap().clone())
        }

        async fn query_order(&self, order_id: &str) -> ExchangeResult<OrderFill> {
            self.query_results.lock().unwrap().pop_front().unwrap_or_else(|| {
                // market orders fill in full by default
                let volume = self
                    .submitted
                    .lock()
                    .unwrap()
                    .last()
                    .map(|o| o.volume)
                    .unwrap_or(0.0);
                Ok(fill(order_id, OrderState::Closed, volume, volume, 0.0))
            })
        }
    }

    fn adapter(venue: MockVenue) -> (Arc<MockVenue>, ExchangeAdapter<MockVenue>) {
        let venue = Arc::new(venue);
        let config = AdapterConfig {
            fill_poll_interval: Duration::from_millis(1),
            spread_exempt_pairs: ["SHIB/EUR".to_string()].into_iter().collect(),
            ..Default::default()
        };
        (venue.clone(), ExchangeAdapter::new(venue, config))
    }

    #[tokio::test]
    async fn test_market_buy_with_stop_leg() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        let intent = OrderIntent::buy_notional("SOL/EUR", 50.0)
            .unwrap()
            .with_stop(Some(95.123))
            .unwrap();

        let result = adapter.place_order(&intent).await;
        assert!(result.success, "{}", result.reason());
        assert_eq!(result.filled_quantity, 0.5);
        // no reported average price: the reference ask is used
        assert_eq!(result.filled_price, 100.0);

        let submitted = venue.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].order_type, OrderType::Market);
        assert_eq!(submitted[0].stop_price, Some(95.12));
    }

    #[tokio::test]
    async fn test_ghost_mode_omits_stop_leg() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        let intent = OrderIntent::buy("SOL/EUR", 0.5).unwrap();
        assert!(adapter.place_order(&intent).await.success);
        assert_eq!(venue.submitted()[0].stop_price, None);
    }

    #[tokio::test]
    async fn test_spread_too_wide_rejected_locally() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.0, 100.0));
        let result = adapter
            .place_order(&OrderIntent::buy("SOL/EUR", 1.0).unwrap())
            .await;
        assert!(!result.success);
        assert!(matches!(
            result.failure,
            Some(ExchangeError::Precondition(PreconditionFailure::SpreadTooWide { .. }))
        ));
        assert!(venue.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_exempt_pair_skips_spread_check() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.0, 100.0));
        let result = adapter
            .place_order(&OrderIntent::buy("SHIB/EUR", 1.0).unwrap())
            .await;
        assert!(result.success, "{}", result.reason());
        assert_eq!(venue.submitted().len(), 1);
    }

    #[test]
    fn test_per_pair_spread_ceiling() {
        let mut config = AdapterConfig::default();
        config.spread_ceilings.insert("DOGE/EUR".to_string(), 1.5);
        assert_eq!(config.spread_ceiling("DOGE/EUR"), Some(1.5));
        assert_eq!(config.spread_ceiling("ETH/EUR"), Some(0.5));
    }

    #[tokio::test]
    async fn test_below_minimum_never_reaches_network() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        let result = adapter
            .place_order(&OrderIntent::buy_notional("SOL/EUR", 3.0).unwrap())
            .await;
        assert!(matches!(
            result.failure,
            Some(ExchangeError::Precondition(PreconditionFailure::BelowMinimum { .. }))
        ));
        assert!(venue.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_sacred_asset_sell_refused() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(50_000.0, 50_001.0));
        let result = adapter
            .place_order(&OrderIntent::sell("BTC/EUR", 0.1).unwrap())
            .await;
        assert!(matches!(
            result.failure,
            Some(ExchangeError::Precondition(PreconditionFailure::SacredAsset { .. }))
        ));
        assert!(venue.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_post_only_rejection_falls_back_to_market() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        venue.push_add(Err(ExchangeError::rejected(
            RejectionKind::PostOnlyWouldTake,
            "EOrder:Post only order",
        )));
        let intent = OrderIntent::buy("SOL/EUR", 1.0)
            .unwrap()
            .with_execution(ExecutionStyle::MakerPreferred);

        let result = adapter.place_order(&intent).await;
        assert!(result.success, "{}", result.reason());
        let submitted = venue.submitted();
        assert_eq!(submitted.len(), 2);
        assert!(submitted[0].post_only);
        assert_eq!(submitted[0].price, Some(99.9));
        assert_eq!(submitted[1].order_type, OrderType::Market);
    }

    #[tokio::test]
    async fn test_maker_only_reports_soft_failure() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        venue.push_add(Err(ExchangeError::rejected(
            RejectionKind::PostOnlyWouldTake,
            "EOrder:Post only order",
        )));
        let intent = OrderIntent::buy("SOL/EUR", 1.0)
            .unwrap()
            .with_execution(ExecutionStyle::MakerOnly);

        let result = adapter.place_order(&intent).await;
        assert!(!result.success);
        assert!(matches!(
            result.failure,
            Some(ExchangeError::Rejected {
                kind: RejectionKind::PostOnlyWouldTake,
                ..
            })
        ));
        assert_eq!(venue.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_resting_maker_fill() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        venue.push_query(fill("O-1", OrderState::Open, 1.0, 0.0, 0.0));
        venue.push_query(fill("O-1", OrderState::Closed, 1.0, 1.0, 99.9));
        let intent = OrderIntent::buy("SOL/EUR", 1.0)
            .unwrap()
            .with_execution(ExecutionStyle::MakerPreferred);

        let result = adapter.place_order(&intent).await;
        assert!(result.success);
        assert_eq!(result.filled_price, 99.9);
        assert_eq!(venue.submitted().len(), 1);
        assert!(venue.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unfilled_maker_cancelled_and_remainder_marketed() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        for _ in 0..3 {
            venue.push_query(fill("O-1", OrderState::Open, 1.0, 0.4, 99.9));
        }
        // after cancel
        venue.push_query(fill("O-1", OrderState::Canceled, 1.0, 0.4, 99.9));
        // market remainder
        venue.push_query(fill("O-2", OrderState::Closed, 0.6, 0.6, 100.0));
        let intent = OrderIntent::buy("SOL/EUR", 1.0)
            .unwrap()
            .with_execution(ExecutionStyle::MakerPreferred);

        let result = adapter.place_order(&intent).await;
        assert!(result.success, "{}", result.reason());
        assert_eq!(venue.cancelled.lock().unwrap().as_slice(), ["O-1"]);
        let submitted = venue.submitted();
        assert_eq!(submitted[1].order_type, OrderType::Market);
        assert_eq!(submitted[1].volume, 0.6);
        assert!((result.filled_quantity - 1.0).abs() < 1e-9);
        assert!((result.filled_price - 99.96).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_insufficient_funds_recovered_by_cancelling_resting_orders() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        venue.resting.lock().unwrap().push(OpenOrder {
            order_id: "OREST".to_string(),
            pair: "SOL/EUR".to_string(),
            side: OrderSide::Sell,
            quantity: 1.0,
            executed: 0.0,
        });
        venue.push_add(Err(insufficient()));

        let result = adapter
            .place_order(&OrderIntent::sell("SOL/EUR", 1.0).unwrap())
            .await;
        assert!(result.success, "{}", result.reason());
        assert_eq!(venue.cancelled.lock().unwrap().as_slice(), ["OREST"]);
        assert_eq!(venue.submitted().len(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_funds_resized_within_tolerance() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        venue.free.lock().unwrap().insert("SOL".to_string(), 0.99567);
        venue.push_add(Err(insufficient()));

        let result = adapter
            .place_order(&OrderIntent::sell("SOL/EUR", 1.0).unwrap())
            .await;
        assert!(result.success, "{}", result.reason());
        assert_eq!(venue.submitted()[1].volume, 0.9956);
        assert_eq!(result.filled_quantity, 0.9956);
    }

    #[tokio::test]
    async fn test_insufficient_funds_gives_up_outside_tolerance() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        venue.free.lock().unwrap().insert("SOL".to_string(), 0.9);
        venue.push_add(Err(insufficient()));

        let result = adapter
            .place_order(&OrderIntent::sell("SOL/EUR", 1.0).unwrap())
            .await;
        assert!(!result.success);
        assert!(result.failure.unwrap().is_insufficient_funds());
        assert_eq!(venue.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_limits_are_cached() {
        let (venue, adapter) = adapter(MockVenue::with_ticker(99.9, 100.0));
        adapter.get_limits("SOL/EUR").await.unwrap();
        adapter.get_limits("SOL/EUR").await.unwrap();
        adapter
            .place_order(&OrderIntent::buy("SOL/EUR", 1.0).unwrap())
            .await;
        assert_eq!(venue.asset_pair_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_tracks_transport_failures() {
        let (venue, adapter) = adapter(MockVenue::default());
        assert!(!adapter.is_healthy().await);
        adapter.connect().await.unwrap();
        assert!(adapter.is_healthy().await);

        for _ in 0..3 {
            assert!(adapter.get_ticker("SOL/EUR").await.is_err());
        }
        assert!(!adapter.is_healthy().await);

        *venue.ticker.lock().unwrap() = Some(Ticker {
            bid: 1.0,
            ask: 1.0,
            last: 1.0,
        });
        adapter.get_ticker("SOL/EUR").await.unwrap();
        assert!(adapter.is_healthy().await);
    }
}
