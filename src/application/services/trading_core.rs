//! Trading core: the glue between the risk engine and the exchange adapter.
//!
//! Opening places the entry order first and records the position only on a
//! confirmed fill. Exits are evaluated per tick; when the sell fails the
//! position stays untouched so the next tick re-derives the same decision.

use crate::domain::entities::market::{MarketLimits, Ticker};
use crate::domain::entities::order::{ExecutionStyle, OrderIntent, OrderSide, OrderSize};
use crate::domain::entities::position::{EntryContext, Position, PositionSide};
use crate::domain::errors::TradeError;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::services::position_manager::{OpenRequest, PositionManager};
use crate::domain::value_objects::exit_decision::ExitDecision;
use crate::domain::value_objects::pnl::RealizedPnl;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Filled share of a full exit above which the position counts as closed
const FULL_EXIT_FILL_RATIO: f64 = 0.99;

#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Never attach the server-side stop leg; exits rely on local monitoring
    pub ghost_mode: bool,
    /// Style used for entries. Exits always take liquidity.
    pub entry_execution: ExecutionStyle,
    /// Reference capital for the circuit breaker
    pub initial_capital: f64,
    pub quote_asset: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            ghost_mode: false,
            entry_execution: ExecutionStyle::Market,
            initial_capital: 1000.0,
            quote_asset: "EUR".to_string(),
        }
    }
}

/// Strategy-layer request to open (or average into) a position
#[derive(Debug, Clone)]
pub struct OpenPositionRequest {
    pub pair: String,
    pub size: OrderSize,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub context: EntryContext,
}

impl OpenPositionRequest {
    pub fn notional(pair: &str, cost: f64) -> Self {
        Self {
            pair: pair.to_string(),
            size: OrderSize::Notional(cost),
            stop_loss: None,
            take_profit: None,
            context: EntryContext::default(),
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    pub fn with_context(mut self, context: EntryContext) -> Self {
        self.context = context;
        self
    }
}

/// What an exit on one tick did
#[derive(Debug, Clone, PartialEq)]
pub struct ExitOutcome {
    pub decision: ExitDecision,
    pub realized: RealizedPnl,
    pub order_id: Option<String>,
    pub filled_quantity: f64,
}

pub struct TradingCore {
    exchange: Arc<dyn ExchangeClient>,
    engine: Arc<PositionManager>,
    config: TradingConfig,
    /// Held from the book check until the fill is recorded, so one pair
    /// never has two orders in flight
    pair_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TradingCore {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        engine: Arc<PositionManager>,
        config: TradingConfig,
    ) -> Self {
        Self {
            exchange,
            engine,
            config,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    fn pair_lock(&self, pair: &str) -> Arc<AsyncMutex<()>> {
        self.pair_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(pair.to_string())
            .or_default()
            .clone()
    }

    pub fn engine(&self) -> &Arc<PositionManager> {
        &self.engine
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeClient> {
        &self.exchange
    }

    /// Buy and record a long position.
    ///
    /// Refused while the circuit breaker is latched or when the position
    /// would overload its correlation group. An existing position is returned
    /// unchanged unless averaging is enabled.
    pub async fn open_position(&self, request: OpenPositionRequest) -> Result<Position, TradeError> {
        let pair = request.pair.as_str();
        let lock = self.pair_lock(pair);
        let _in_flight = lock.lock().await;
        if let Some(reason) = self.engine.halt_reason() {
            warn!("Refusing to open {}: {}", pair, reason);
            return Err(TradeError::Halted(reason));
        }
        if !self.engine.config().allow_averaging {
            if let Some(existing) = self.engine.get_position(pair) {
                debug!("{} already open, averaging disabled", pair);
                return Ok(existing);
            }
        }

        let notional = match request.size {
            OrderSize::Notional(cost) => cost,
            OrderSize::Quantity(quantity) => {
                quantity.value() * self.exchange.get_ticker(pair).await?.ask
            }
        };
        let capital = self.current_capital().await?;
        if let Some(reason) = self.engine.would_exceed_group_limit(pair, notional, capital) {
            warn!("Refusing to open {}: {}", pair, reason);
            return Err(TradeError::ExposureLimit(reason));
        }

        let server_stop = if self.config.ghost_mode {
            None
        } else {
            request.stop_loss
        };
        let intent = OrderIntent {
            pair: pair.to_string(),
            side: OrderSide::Buy,
            size: request.size,
            limit_price: None,
            stop_price: None,
            execution: self.config.entry_execution,
        }
        .with_stop(server_stop)?;

        let result = self.exchange.place_order(&intent).await;
        if !result.success {
            return Err(match result.failure {
                Some(e) => TradeError::Exchange(e),
                None => TradeError::NotFilled(format!("entry on {} not filled", pair)),
            });
        }

        let position = self.engine.open(
            OpenRequest::long(pair, result.filled_price, result.filled_quantity)
                .with_stop_loss(request.stop_loss)
                .with_take_profit(request.take_profit)
                .with_context(request.context)
                .with_order_id(result.order_id.clone()),
        )?;
        info!(
            "Opened {} {} @ {} (stop {:?}{})",
            position.quantity,
            pair,
            position.entry_price,
            position.stop_loss,
            if server_stop.is_some() { ", server leg" } else { "" }
        );
        Ok(position)
    }

    /// Exit check against a live quote, priced on the side a close would hit
    pub async fn on_quote(&self, pair: &str, ticker: &Ticker) -> Result<Option<ExitOutcome>, TradeError> {
        let Some(position) = self.engine.get_position(pair) else {
            return Ok(None);
        };
        self.on_tick(pair, ticker.exit_price(position.side)).await
    }

    /// Feed one price into the engine and execute any exit it asks for
    pub async fn on_tick(&self, pair: &str, price: f64) -> Result<Option<ExitOutcome>, TradeError> {
        if !self.engine.has_position(pair) {
            return Ok(None);
        }
        let lock = self.pair_lock(pair);
        let _in_flight = lock.lock().await;
        let limits = self.exchange.get_limits(pair).await?;
        let Some(decision) = self
            .engine
            .check_exits(pair, price, min_notional(&limits, price))
        else {
            return Ok(None);
        };
        self.execute_exit(pair, decision).await.map(Some)
    }

    async fn execute_exit(&self, pair: &str, decision: ExitDecision) -> Result<ExitOutcome, TradeError> {
        let position = self
            .engine
            .get_position(pair)
            .ok_or_else(|| TradeError::NoPosition(pair.to_string()))?;
        let quantity = position.quantity * decision.close_ratio.min(1.0);
        info!(
            "Exit {} on {}: selling {} of {}",
            decision.reason, pair, quantity, position.quantity
        );

        let intent = match position.side {
            PositionSide::Long => OrderIntent::sell(pair, quantity)?,
            PositionSide::Short => OrderIntent::buy(pair, quantity)?,
        };
        let result = self.exchange.place_order(&intent).await;
        if !result.success {
            warn!(
                "Exit {} on {} failed, position kept: {}",
                decision.reason,
                pair,
                result.reason()
            );
            return Err(match result.failure {
                Some(e) => TradeError::Exchange(e),
                None => TradeError::NotFilled(format!("exit on {} not filled", pair)),
            });
        }

        let filled_ratio = result.filled_quantity / position.quantity;
        let ratio = if decision.is_full_exit() && filled_ratio >= FULL_EXIT_FILL_RATIO {
            1.0
        } else {
            filled_ratio.min(1.0)
        };
        let realized = self.engine.close_partial(
            pair,
            result.filled_price,
            ratio,
            decision.reason,
            result.order_id.as_deref(),
        )?;

        Ok(ExitOutcome {
            decision,
            realized,
            order_id: result.order_id,
            filled_quantity: result.filled_quantity,
        })
    }

    /// Quote balance plus the marked value of every open position
    pub async fn current_capital(&self) -> Result<f64, TradeError> {
        let balances = self.exchange.get_balance().await?;
        let cash = balances
            .get(&self.config.quote_asset)
            .copied()
            .unwrap_or(0.0);
        Ok(cash + self.engine.exposure().total_eur)
    }

    /// Mark capital against the reference and update the latch
    pub async fn evaluate_circuit_breaker(&self) -> Result<(bool, String), TradeError> {
        let capital = self.current_capital().await?;
        Ok(self
            .engine
            .check_circuit_breaker(capital, self.config.initial_capital))
    }
}

/// Smallest notional the venue will accept at `price`
fn min_notional(limits: &MarketLimits, price: f64) -> f64 {
    limits.cost_min.max(limits.order_min * price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market::{OpenOrder, Ticker};
    use crate::domain::entities::order::OrderResult;
    use crate::domain::errors::{ExchangeError, RejectionKind};
    use crate::domain::events::EventBus;
    use crate::domain::repositories::exchange_client::ExchangeResult;
    use crate::domain::services::position_manager::RiskConfig;
    use crate::domain::value_objects::exit_decision::ExitReason;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockExchange {
        ask: Mutex<f64>,
        eur: Mutex<f64>,
        fail_sells: Mutex<bool>,
        placed: Mutex<Vec<OrderIntent>>,
        fill_delay: Mutex<std::time::Duration>,
    }

    impl MockExchange {
        fn new(ask: f64) -> Self {
            Self {
                ask: Mutex::new(ask),
                eur: Mutex::new(1000.0),
                fail_sells: Mutex::new(false),
                placed: Mutex::new(Vec::new()),
                fill_delay: Mutex::new(std::time::Duration::ZERO),
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        fn name(&self) -> &str {
            "mock"
        }

        async fn connect(&self) -> ExchangeResult<()> {
            Ok(())
        }

        async fn get_ticker(&self, _pair: &str) -> ExchangeResult<Ticker> {
            let ask = *self.ask.lock().unwrap();
            Ok(Ticker {
                bid: ask,
                ask,
                last: ask,
            })
        }

        async fn get_balance(&self) -> ExchangeResult<HashMap<String, f64>> {
            Ok([("EUR".to_string(), *self.eur.lock().unwrap())]
                .into_iter()
                .collect())
        }

        async fn get_limits(&self, pair: &str) -> ExchangeResult<MarketLimits> {
            Ok(MarketLimits {
                pair: pair.to_string(),
                order_min: 0.001,
                cost_min: 5.0,
                price_decimals: 2,
                lot_decimals: 6,
                maker_fee_pct: 0.16,
                taker_fee_pct: 0.26,
            })
        }

        async fn place_order(&self, intent: &OrderIntent) -> OrderResult {
            self.placed.lock().unwrap().push(intent.clone());
            let delay = *self.fill_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if intent.side == OrderSide::Sell && *self.fail_sells.lock().unwrap() {
                return OrderResult::failed(ExchangeError::transport(6, "timeout"));
            }
            let price = *self.ask.lock().unwrap();
            OrderResult::filled("OX", price, intent.quantity_at(price))
        }

        async fn cancel(&self, _order_id: &str) -> ExchangeResult<()> {
            Ok(())
        }

        async fn open_orders(&self, _pair: Option<&str>) -> ExchangeResult<Vec<OpenOrder>> {
            Ok(Vec::new())
        }
    }

    fn core(
        exchange: Arc<MockExchange>,
        risk: RiskConfig,
        ghost_mode: bool,
    ) -> TradingCore {
        let engine = Arc::new(PositionManager::new(risk, EventBus::new()));
        TradingCore::new(
            exchange,
            engine,
            TradingConfig {
                ghost_mode,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_open_records_fill_and_attaches_stop() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let core = core(exchange.clone(), RiskConfig::default(), false);

        let position = core
            .open_position(OpenPositionRequest::notional("SOL/EUR", 50.0).with_stop_loss(95.0))
            .await
            .unwrap();
        assert_eq!(position.entry_price, 100.0);
        assert_eq!(position.quantity, 0.5);
        assert_eq!(position.stop_loss, Some(95.0));

        let placed = exchange.placed.lock().unwrap();
        assert_eq!(placed[0].stop_price.map(|p| p.value()), Some(95.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_on_one_pair_buy_once() {
        let exchange = Arc::new(MockExchange::new(100.0));
        *exchange.fill_delay.lock().unwrap() = std::time::Duration::from_millis(50);
        let core = Arc::new(core(exchange.clone(), RiskConfig::default(), false));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let core = core.clone();
                tokio::spawn(async move {
                    core.open_position(OpenPositionRequest::notional("SOL/EUR", 50.0))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let bought: f64 = exchange
            .placed
            .lock()
            .unwrap()
            .iter()
            .map(|intent| intent.quantity_at(100.0))
            .sum();
        assert_eq!(bought, 0.5);
        assert_eq!(core.engine().get_position("SOL/EUR").unwrap().quantity, bought);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_averaging_books_every_fill() {
        let exchange = Arc::new(MockExchange::new(100.0));
        *exchange.fill_delay.lock().unwrap() = std::time::Duration::from_millis(50);
        let risk = RiskConfig {
            allow_averaging: true,
            ..Default::default()
        };
        let core = Arc::new(core(exchange.clone(), risk, false));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let core = core.clone();
                tokio::spawn(async move {
                    core.open_position(OpenPositionRequest::notional("SOL/EUR", 50.0))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(exchange.placed.lock().unwrap().len(), 3);
        let position = core.engine().get_position("SOL/EUR").unwrap();
        assert!((position.quantity - 1.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_short_stop_checks_the_ask() {
        let exchange = Arc::new(MockExchange::new(105.5));
        let core = core(exchange.clone(), RiskConfig::default(), false);
        core.engine()
            .open(OpenRequest::short("ETH/EUR", 100.0, 1.0).with_stop_loss(Some(105.0)))
            .unwrap();
        let quote = Ticker {
            bid: 104.0,
            ask: 105.5,
            last: 104.8,
        };

        let outcome = core.on_quote("ETH/EUR", &quote).await.unwrap().unwrap();
        assert_eq!(outcome.decision.reason.code(), "STOP_LOSS");
        let placed = exchange.placed.lock().unwrap();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Buy);
        drop(placed);
        assert!(!core.engine().has_position("ETH/EUR"));
    }

    #[tokio::test]
    async fn test_long_stop_checks_the_bid() {
        let exchange = Arc::new(MockExchange::new(95.5));
        let core = core(exchange.clone(), RiskConfig::default(), false);
        core.engine()
            .open(OpenRequest::long("ETH/EUR", 100.0, 1.0).with_stop_loss(Some(95.0)))
            .unwrap();

        let quote = Ticker {
            bid: 95.2,
            ask: 95.6,
            last: 95.3,
        };
        assert!(core.on_quote("ETH/EUR", &quote).await.unwrap().is_none());

        // ask still above the stop
        let quote = Ticker { bid: 94.9, ..quote };
        let outcome = core.on_quote("ETH/EUR", &quote).await.unwrap().unwrap();
        assert_eq!(outcome.decision.reason.code(), "STOP_LOSS");
    }

    #[tokio::test]
    async fn test_ghost_mode_keeps_local_stop_only() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let core = core(exchange.clone(), RiskConfig::default(), true);

        let position = core
            .open_position(OpenPositionRequest::notional("SOL/EUR", 50.0).with_stop_loss(95.0))
            .await
            .unwrap();
        assert_eq!(position.stop_loss, Some(95.0));
        assert_eq!(exchange.placed.lock().unwrap()[0].stop_price, None);
    }

    #[tokio::test]
    async fn test_second_open_returns_existing_without_order() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let core = core(exchange.clone(), RiskConfig::default(), false);

        let first = core
            .open_position(OpenPositionRequest::notional("SOL/EUR", 50.0))
            .await
            .unwrap();
        *exchange.ask.lock().unwrap() = 110.0;
        let second = core
            .open_position(OpenPositionRequest::notional("SOL/EUR", 50.0))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(exchange.placed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_halted_engine_refuses_opens() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let core = core(exchange.clone(), RiskConfig::default(), false);
        *exchange.eur.lock().unwrap() = 895.0;

        let (halted, _) = core.evaluate_circuit_breaker().await.unwrap();
        assert!(halted);
        let result = core
            .open_position(OpenPositionRequest::notional("SOL/EUR", 50.0))
            .await;
        assert!(matches!(result, Err(TradeError::Halted(_))));
        assert!(exchange.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exposure_limit_refuses_opens() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let core = core(exchange.clone(), RiskConfig::default(), false);
        let result = core
            .open_position(OpenPositionRequest::notional("SOL/EUR", 600.0))
            .await;
        assert!(matches!(result, Err(TradeError::ExposureLimit(_))));
        assert!(exchange.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_loss_tick_sells_and_closes() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let core = core(exchange.clone(), RiskConfig::default(), false);
        core.open_position(OpenPositionRequest::notional("SOL/EUR", 50.0).with_stop_loss(95.0))
            .await
            .unwrap();

        assert!(core.on_tick("SOL/EUR", 99.0).await.unwrap().is_none());

        *exchange.ask.lock().unwrap() = 94.0;
        let outcome = core.on_tick("SOL/EUR", 94.0).await.unwrap().unwrap();
        assert_eq!(outcome.decision.reason, ExitReason::StopLoss);
        assert!(outcome.realized.pnl_eur.is_loss());
        assert!(!core.engine().has_position("SOL/EUR"));

        let placed = exchange.placed.lock().unwrap();
        assert_eq!(placed[1].side, OrderSide::Sell);
        assert_eq!(placed[1].quantity_at(94.0), 0.5);
    }

    #[tokio::test]
    async fn test_failed_exit_keeps_position_for_next_tick() {
        let exchange = Arc::new(MockExchange::new(100.0));
        let core = core(exchange.clone(), RiskConfig::default(), false);
        core.open_position(OpenPositionRequest::notional("SOL/EUR", 50.0).with_stop_loss(95.0))
            .await
            .unwrap();
        let before = core.engine().get_position("SOL/EUR").unwrap();

        *exchange.fail_sells.lock().unwrap() = true;
        let result = core.on_tick("SOL/EUR", 94.0).await;
        assert!(matches!(
            result,
            Err(TradeError::Exchange(ExchangeError::Transport { .. }))
        ));
        let after = core.engine().get_position("SOL/EUR").unwrap();
        assert_eq!(after.quantity, before.quantity);
        assert_eq!(after.stop_loss, before.stop_loss);

        // the same decision fires again once the venue recovers
        *exchange.fail_sells.lock().unwrap() = false;
        *exchange.ask.lock().unwrap() = 94.0;
        let outcome = core.on_tick("SOL/EUR", 94.0).await.unwrap().unwrap();
        assert_eq!(outcome.decision.reason, ExitReason::StopLoss);
        assert!(!core.engine().has_position("SOL/EUR"));
    }

    #[tokio::test]
    async fn test_rejected_entry_records_nothing() {
        struct Rejecting;

        #[async_trait]
        impl ExchangeClient for Rejecting {
            fn name(&self) -> &str {
                "rejecting"
            }
            async fn connect(&self) -> ExchangeResult<()> {
                Ok(())
            }
            async fn get_ticker(&self, _pair: &str) -> ExchangeResult<Ticker> {
                Ok(Ticker {
                    bid: 100.0,
                    ask: 100.0,
                    last: 100.0,
                })
            }
            async fn get_balance(&self) -> ExchangeResult<HashMap<String, f64>> {
                Ok(HashMap::new())
            }
            async fn get_limits(&self, _pair: &str) -> ExchangeResult<MarketLimits> {
                Err(ExchangeError::transport(1, "unused"))
            }
            async fn place_order(&self, _intent: &OrderIntent) -> OrderResult {
                OrderResult::failed(ExchangeError::rejected(
                    RejectionKind::InsufficientFunds,
                    "EOrder:Insufficient funds",
                ))
            }
            async fn cancel(&self, _order_id: &str) -> ExchangeResult<()> {
                Ok(())
            }
            async fn open_orders(&self, _pair: Option<&str>) -> ExchangeResult<Vec<OpenOrder>> {
                Ok(Vec::new())
            }
        }

        let engine = Arc::new(PositionManager::new(RiskConfig::default(), EventBus::new()));
        let core = TradingCore::new(Arc::new(Rejecting), engine.clone(), TradingConfig::default());
        let result = core
            .open_position(OpenPositionRequest::notional("SOL/EUR", 5.0))
            .await;
        assert!(matches!(result, Err(TradeError::Exchange(_))));
        assert!(engine.positions().is_empty());
    }

    #[test]
    fn test_min_notional_uses_stricter_limit() {
        let limits = MarketLimits {
            pair: "SOL/EUR".to_string(),
            order_min: 0.1,
            cost_min: 5.0,
            price_decimals: 2,
            lot_decimals: 4,
            maker_fee_pct: 0.16,
            taker_fee_pct: 0.26,
        };
        assert_eq!(min_notional(&limits, 100.0), 10.0);
        assert_eq!(min_notional(&limits, 10.0), 5.0);
    }
}
