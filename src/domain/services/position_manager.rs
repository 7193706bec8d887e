//! Position & risk engine.
//!
//! Owns the position table, the session ledger and the circuit-breaker latch.
//! All mutation happens under one book lock. Every state change that must
//! survive a restart (open, close, ratchet advance, breaker trip/reset)
//! queues a snapshot to the [`BookWriter`] before the lock is released, so
//! saves keep the order of the changes while the disk work happens off the
//! lock.

use crate::domain::entities::ledger::{Ledger, LifetimeStats};
use crate::domain::entities::market::base_asset;
use crate::domain::entities::position::{
    ClosedPosition, EntryContext, Position, PositionSide, PositionStatus,
};
use crate::domain::errors::{PersistenceError, TradeError, ValidationError};
use crate::domain::events::{EngineEvent, EventBus};
use crate::domain::repositories::book_store::{BookSnapshot, BookStore};
use crate::domain::services::book_writer::BookWriter;
use crate::domain::services::circuit_breaker::{
    BreakerTransition, CircuitBreakerConfig, CircuitBreakerState,
};
use crate::domain::services::exposure::{ExposureConfig, ExposureReport};
use crate::domain::services::ratchet::GoldenRatchet;
use crate::domain::value_objects::exit_decision::{ExitDecision, ExitReason};
use crate::domain::value_objects::pnl::{PnL, RealizedPnl};
use crate::domain::value_objects::price::Price;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Value band above the venue minimum inside which a position is force-sold
pub const DUST_ESCAPE_MARGIN: f64 = 1.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitMode {
    /// Golden-ratio trailing stop
    Ratchet,
    /// Fixed take-profit ladder
    Ladder,
}

impl ExitMode {
    pub fn from_str_lossy(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "ratchet" | "trailing" => Some(ExitMode::Ratchet),
            "ladder" | "take_profit" => Some(ExitMode::Ladder),
            _ => None,
        }
    }
}

/// One rung of the take-profit ladder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitRung {
    /// Gross gain from entry, in percent
    pub gain_pct: f64,
    /// Share of the remaining quantity to sell
    pub close_ratio: f64,
}

impl TakeProfitRung {
    /// Parse `"2:0.5,4:1.0"`. Invalid entries are skipped; rungs come back
    /// sorted by gain.
    pub fn parse_ladder(raw: &str) -> Vec<TakeProfitRung> {
        let mut rungs: Vec<TakeProfitRung> = raw
            .split(',')
            .filter_map(|entry| {
                let (gain, ratio) = entry.trim().split_once(':')?;
                let gain_pct = gain.trim().parse::<f64>().ok()?;
                let close_ratio = ratio.trim().parse::<f64>().ok()?;
                if gain_pct > 0.0 && close_ratio > 0.0 && close_ratio <= 1.0 {
                    Some(TakeProfitRung {
                        gain_pct,
                        close_ratio,
                    })
                } else {
                    None
                }
            })
            .collect();
        rungs.sort_by(|a, b| a.gain_pct.total_cmp(&b.gain_pct));
        rungs
    }
}

/// Risk policy consumed by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    pub allow_averaging: bool,
    pub exit_mode: ExitMode,
    pub ratchet: GoldenRatchet,
    pub take_profit_ladder: Vec<TakeProfitRung>,
    /// Age after which a flat position is recycled; zero disables
    pub stagnation_hours: f64,
    pub stagnation_min_gain_pct: f64,
    pub stagnation_max_gain_pct: f64,
    /// Base assets this engine never sells
    pub sacred_assets: Vec<String>,
    /// Share of realized gains set aside in the treasure
    pub treasure_fraction: f64,
    /// Same-day closed positions kept for orphan reconciliation
    pub recent_closed_window: usize,
    pub circuit_breaker: CircuitBreakerConfig,
    pub exposure: ExposureConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            allow_averaging: false,
            exit_mode: ExitMode::Ratchet,
            ratchet: GoldenRatchet::default(),
            take_profit_ladder: TakeProfitRung::parse_ladder("2:0.5,4:1.0"),
            stagnation_hours: 24.0,
            stagnation_min_gain_pct: 0.0,
            stagnation_max_gain_pct: 0.8,
            sacred_assets: vec!["BTC".to_string()],
            treasure_fraction: 0.10,
            recent_closed_window: 50,
            circuit_breaker: CircuitBreakerConfig::default(),
            exposure: ExposureConfig::default(),
        }
    }
}

/// Parameters for opening (or averaging into) a position after a fill
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub pair: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub context: EntryContext,
    pub entry_order_id: Option<String>,
    pub entry_time: DateTime<Utc>,
}

impl OpenRequest {
    pub fn long(pair: &str, entry_price: f64, quantity: f64) -> Self {
        Self {
            pair: pair.to_string(),
            side: PositionSide::Long,
            entry_price,
            quantity,
            stop_loss: None,
            take_profit: None,
            context: EntryContext::default(),
            entry_order_id: None,
            entry_time: Utc::now(),
        }
    }

    pub fn short(pair: &str, entry_price: f64, quantity: f64) -> Self {
        Self {
            side: PositionSide::Short,
            ..Self::long(pair, entry_price, quantity)
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self
    }

    pub fn with_take_profit(mut self, take_profit: Option<f64>) -> Self {
        self.take_profit = take_profit;
        self
    }

    pub fn with_context(mut self, context: EntryContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_order_id(mut self, order_id: Option<String>) -> Self {
        self.entry_order_id = order_id;
        self
    }

    pub fn with_entry_time(mut self, entry_time: DateTime<Utc>) -> Self {
        self.entry_time = entry_time;
        self
    }
}

/// Point-in-time copy of the engine state for status readers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub positions: Vec<Position>,
    pub recent_closed: Vec<ClosedPosition>,
    pub ledger: Ledger,
    pub lifetime: LifetimeStats,
    pub circuit_breaker: CircuitBreakerState,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Book {
    positions: HashMap<String, Position>,
    recent_closed: Vec<ClosedPosition>,
    ledger: Ledger,
    lifetime: LifetimeStats,
    breaker: CircuitBreakerState,
}

impl Book {
    fn from_snapshot(snapshot: BookSnapshot) -> Self {
        let positions = snapshot
            .open
            .into_iter()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| (p.pair.clone(), p))
            .collect();
        Self {
            positions,
            recent_closed: snapshot.recent_closed,
            ledger: snapshot.ledger,
            lifetime: snapshot.lifetime,
            breaker: snapshot.breaker,
        }
    }

    fn to_snapshot(&self) -> BookSnapshot {
        let mut open: Vec<Position> = self.positions.values().cloned().collect();
        open.sort_by(|a, b| a.pair.cmp(&b.pair));
        BookSnapshot {
            open,
            recent_closed: self.recent_closed.clone(),
            ledger: self.ledger.clone(),
            breaker: self.breaker.clone(),
            lifetime: self.lifetime.clone(),
        }
    }

    /// Keep only today's closes, newest last, capped at `window`
    fn prune_recent_closed(&mut self, window: usize, now: DateTime<Utc>) {
        let today = now.date_naive();
        self.recent_closed
            .retain(|c| c.exit_time.date_naive() == today);
        if self.recent_closed.len() > window {
            let excess = self.recent_closed.len() - window;
            self.recent_closed.drain(..excess);
        }
    }
}

/// The position & risk engine
pub struct PositionManager {
    config: RiskConfig,
    book: Mutex<Book>,
    writer: Option<BookWriter>,
    events: EventBus,
}

impl PositionManager {
    /// Engine without durable storage
    pub fn new(config: RiskConfig, events: EventBus) -> Self {
        Self {
            config,
            book: Mutex::new(Book::default()),
            writer: None,
            events,
        }
    }

    /// Engine backed by `store`, restoring whatever it last saved
    pub fn with_store(
        config: RiskConfig,
        store: Arc<dyn BookStore>,
        events: EventBus,
    ) -> Result<Self, PersistenceError> {
        let snapshot = store.load()?;
        let book = Book::from_snapshot(snapshot);
        info!(
            "Restored {} open position(s), {} trade(s) this session, treasure {:.2}€, breaker {}",
            book.positions.len(),
            book.ledger.trades,
            book.ledger.treasure_eur,
            if book.breaker.halted { "HALTED" } else { "armed" }
        );
        Ok(Self {
            config,
            book: Mutex::new(book),
            writer: Some(BookWriter::spawn(store)?),
            events,
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the book for saving. A failed save is logged by the writer and
    /// the in-memory state stays authoritative; the next save carries it.
    fn persist(&self, book: &Book) {
        if let Some(writer) = &self.writer {
            writer.queue(book.to_snapshot());
        }
    }

    /// Block until every change so far is on disk.
    ///
    /// Blocking; async callers go through `spawn_blocking`.
    pub fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush();
        }
    }

    pub fn is_sacred(&self, pair: &str) -> bool {
        let asset = base_asset(pair);
        self.config
            .sacred_assets
            .iter()
            .any(|sacred| sacred.eq_ignore_ascii_case(asset))
    }

    /// Record a confirmed fill.
    ///
    /// If the pair already has an open position it is returned unchanged,
    /// unless averaging is enabled, in which case the fill is merged at a
    /// quantity-weighted entry price.
    pub fn open(&self, request: OpenRequest) -> Result<Position, ValidationError> {
        let candidate = Position::open(
            &request.pair,
            request.side,
            request.entry_price,
            request.quantity,
            request.stop_loss,
            request.take_profit,
            request.context,
            request.entry_time,
        )?;

        let mut book = self.book();

        let position = match book.positions.entry(request.pair.clone()) {
            Entry::Occupied(slot)
                if !self.config.allow_averaging || slot.get().side != request.side =>
            {
                warn!(
                    "Position already open for {}; ignoring new {} fill",
                    request.pair, request.side
                );
                return Ok(slot.get().clone());
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let total = existing.quantity + candidate.quantity;
                existing.entry_price = (existing.entry_price * existing.quantity
                    + candidate.entry_price * candidate.quantity)
                    / total;
                existing.quantity = total;
                if existing.stop_loss.is_none() {
                    existing.stop_loss = candidate.stop_loss;
                }
                if existing.take_profit.is_none() {
                    existing.take_profit = candidate.take_profit;
                }
                existing.update_price(candidate.entry_price);
                info!(
                    "Averaged into {}: qty {:.8} @ avg {:.6}",
                    existing.pair, existing.quantity, existing.entry_price
                );
                existing.clone()
            }
            Entry::Vacant(slot) => {
                let mut position = candidate;
                position.entry_order_id = request.entry_order_id;
                info!(
                    "Opened {} {}: qty {:.8} @ {:.6}, stop {:?}",
                    position.side,
                    position.pair,
                    position.quantity,
                    position.entry_price,
                    position.stop_loss
                );
                slot.insert(position).clone()
            }
        };

        self.persist(&book);
        drop(book);

        self.events.publish(EngineEvent::PositionOpened {
            pair: position.pair.clone(),
            side: position.side.to_string(),
            entry_price: position.entry_price,
            quantity: position.quantity,
            stop_loss: position.stop_loss,
            at: Utc::now(),
        });
        Ok(position)
    }

    /// Mark the position to `price`. Returns the unrealized gain in percent,
    /// or None when no position is open for the pair.
    pub fn update_price(&self, pair: &str, price: f64) -> Option<f64> {
        if Price::new(price).is_err() {
            warn!("Ignoring invalid price {} for {}", price, pair);
            return None;
        }
        let mut book = self.book();
        let position = book.positions.get_mut(pair)?;
        position.update_price(price);
        Some(position.unrealized_pnl_pct())
    }

    /// Exit decision for the open position on `pair` at `price`.
    ///
    /// `min_cost` is the venue's minimum order notional for the pair.
    pub fn check_exits(&self, pair: &str, price: f64, min_cost: f64) -> Option<ExitDecision> {
        self.check_exits_at(pair, price, min_cost, Utc::now())
    }

    pub fn check_exits_at(
        &self,
        pair: &str,
        price: f64,
        min_cost: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        if self.is_sacred(pair) {
            return None;
        }
        if Price::new(price).is_err() {
            warn!("Ignoring invalid price {} for {}", price, pair);
            return None;
        }

        let mut book = self.book();
        let position = book.positions.get_mut(pair)?;
        position.update_price(price);

        let advanced = match self.config.exit_mode {
            ExitMode::Ratchet => self.config.ratchet.advance(position),
            ExitMode::Ladder => None,
        };
        let advance_event = advanced.map(|level| EngineEvent::RatchetAdvanced {
            pair: position.pair.clone(),
            level,
            virtual_stop: position.virtual_stop_loss,
            best_price: position.best_price,
            at: now,
        });

        let decision = self.evaluate_exit(position, price, min_cost, now);
        if let Some(level) = advanced {
            info!(
                "Ratchet {} advanced to L{} (best {:.6}, virtual stop {:?})",
                pair,
                level,
                position.best_price,
                position.virtual_stop_loss
            );
            self.persist(&book);
        }
        drop(book);

        if let Some(event) = advance_event {
            self.events.publish(event);
        }
        if let Some(decision) = &decision {
            debug!(
                "Exit signal on {} @ {}: {} (ratio {:.2})",
                pair, price, decision.reason, decision.close_ratio
            );
        }
        decision
    }

    /// Fixed-precedence exit rules; pure in the position and price
    fn evaluate_exit(
        &self,
        position: &Position,
        price: f64,
        min_cost: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        let value = position.value_at(price);
        if min_cost > 0.0 && value >= min_cost && value <= min_cost * DUST_ESCAPE_MARGIN {
            return Some(ExitDecision::full(ExitReason::DustEscape));
        }

        let gain_pct = position.gain_pct_at(price);
        if self.config.stagnation_hours > 0.0 {
            let age_hours = position.age(now).num_seconds() as f64 / 3600.0;
            if age_hours > self.config.stagnation_hours
                && gain_pct >= self.config.stagnation_min_gain_pct
                && gain_pct <= self.config.stagnation_max_gain_pct
            {
                return Some(ExitDecision::full(ExitReason::Stagnation));
            }
        }

        if position.hard_stop_hit(price) {
            return Some(ExitDecision::full(ExitReason::StopLoss));
        }

        match self.config.exit_mode {
            ExitMode::Ratchet => {
                if position.virtual_stop_hit(price) {
                    let level = position.ratchet_level.unwrap_or(0);
                    return Some(ExitDecision::full(ExitReason::GoldenRatchet(level)));
                }
                None
            }
            ExitMode::Ladder => {
                let decision = self.ladder_exit(position, price, gain_pct)?;
                let remaining = position.quantity * (1.0 - decision.close_ratio) * price;
                if !decision.is_full_exit() && remaining < min_cost * DUST_ESCAPE_MARGIN {
                    // the leftover would be unsellable
                    return Some(ExitDecision::full(decision.reason));
                }
                Some(decision)
            }
        }
    }

    fn ladder_exit(&self, position: &Position, price: f64, gain_pct: f64) -> Option<ExitDecision> {
        let ladder = &self.config.take_profit_ladder;
        if ladder.is_empty() {
            let target = position.take_profit?;
            let reached = match position.side {
                PositionSide::Long => price >= target,
                PositionSide::Short => price <= target,
            };
            return reached.then(|| ExitDecision::full(ExitReason::TakeProfit(1)));
        }

        let next = position.take_profit_hits as usize;
        let rung = ladder.get(next)?;
        if gain_pct < rung.gain_pct {
            return None;
        }
        let reason = ExitReason::TakeProfit(next as u32 + 1);
        if next + 1 == ladder.len() || rung.close_ratio >= 1.0 {
            Some(ExitDecision::full(reason))
        } else {
            Some(ExitDecision::partial(reason, rung.close_ratio))
        }
    }

    /// Finalize the whole position at `exit_price`
    pub fn close(
        &self,
        pair: &str,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<RealizedPnl, TradeError> {
        self.close_partial(pair, exit_price, 1.0, reason, None)
    }

    /// Book the sale of `close_ratio` of the open quantity.
    ///
    /// A ratio of 1.0 (or more) removes the position. Realized P&L feeds the
    /// session ledger, the lifetime stats and the treasure.
    pub fn close_partial(
        &self,
        pair: &str,
        exit_price: f64,
        close_ratio: f64,
        reason: ExitReason,
        exit_order_id: Option<&str>,
    ) -> Result<RealizedPnl, TradeError> {
        let exit_price = Price::new(exit_price)?.value();
        if !close_ratio.is_finite() || close_ratio <= 0.0 {
            return Err(ValidationError::InvalidQuantity(format!(
                "close ratio must be positive, got {}",
                close_ratio
            ))
            .into());
        }
        let now = Utc::now();

        let mut book = self.book();
        let position = book
            .positions
            .get_mut(pair)
            .ok_or_else(|| TradeError::NoPosition(pair.to_string()))?;

        let full = close_ratio >= 1.0;
        let closed_qty = if full {
            position.quantity
        } else {
            position.quantity * close_ratio
        };
        let pnl_pct = position.gain_pct_at(exit_price);
        let pnl_eur = PnL::new(
            (exit_price - position.entry_price) * closed_qty * position.side.direction(),
        )?;

        let record = ClosedPosition {
            id: position.id.clone(),
            pair: position.pair.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            quantity: closed_qty,
            entry_time: position.entry_time,
            exit_time: now,
            pnl_pct,
            pnl_eur: pnl_eur.value(),
            reason: reason.code(),
            exit_order_id: exit_order_id.map(str::to_string),
        };

        if full {
            book.positions.remove(pair);
        } else {
            position.quantity -= closed_qty;
            position.current_price = exit_price;
            if let ExitReason::TakeProfit(rung) = reason {
                position.take_profit_hits = position.take_profit_hits.max(rung);
            }
        }

        let treasure_delta = book
            .ledger
            .record_close(pnl_eur.value(), self.config.treasure_fraction);
        book.lifetime.record_close(pnl_eur.value(), now);
        book.recent_closed.push(record);
        book.prune_recent_closed(self.config.recent_closed_window, now);

        info!(
            "Closed {:.0}% of {} @ {:.6} [{}]: {:+.2}% / {} (treasure {:+.2}€ → {:.2}€)",
            close_ratio.min(1.0) * 100.0,
            pair,
            exit_price,
            reason,
            pnl_pct,
            pnl_eur,
            treasure_delta,
            book.ledger.treasure_eur
        );

        self.persist(&book);
        drop(book);

        self.events.publish(EngineEvent::PositionClosed {
            pair: pair.to_string(),
            reason: reason.code(),
            exit_price,
            close_ratio: close_ratio.min(1.0),
            pnl_pct,
            pnl_eur: pnl_eur.value(),
            at: now,
        });

        Ok(RealizedPnl { pnl_pct, pnl_eur })
    }

    /// Evaluate the drawdown latch. Returns `(halted, reason)`.
    pub fn check_circuit_breaker(&self, current_capital: f64, initial_capital: f64) -> (bool, String) {
        let now = Utc::now();
        let mut book = self.book();
        let transition = book.breaker.evaluate(
            &self.config.circuit_breaker,
            current_capital,
            initial_capital,
            now,
        );
        let status = (book.breaker.halted, book.breaker.reason.clone());

        let event = match transition {
            BreakerTransition::Unchanged => None,
            BreakerTransition::Tripped { reason, drawdown } => {
                error!("CIRCUIT BREAKER TRIPPED: {}. New positions are halted.", reason);
                Some(EngineEvent::CircuitBreakerTripped {
                    reason,
                    drawdown_pct: drawdown * 100.0,
                    at: now,
                })
            }
            BreakerTransition::Recovered { drawdown } => {
                warn!(
                    "Circuit breaker auto-recovered at drawdown {:.2}%",
                    drawdown * 100.0
                );
                Some(EngineEvent::CircuitBreakerReset {
                    automatic: true,
                    at: now,
                })
            }
        };

        if event.is_some() {
            self.persist(&book);
        }
        drop(book);

        if let Some(event) = event {
            self.events.publish(event);
        }
        status
    }

    /// Operator reset of the latch. Returns true if it was set.
    pub fn reset_circuit_breaker(&self) -> bool {
        let mut book = self.book();
        if !book.breaker.reset() {
            return false;
        }
        warn!("Circuit breaker reset by operator");
        self.persist(&book);
        drop(book);

        self.events.publish(EngineEvent::CircuitBreakerReset {
            automatic: false,
            at: Utc::now(),
        });
        true
    }

    pub fn is_halted(&self) -> bool {
        self.book().breaker.halted
    }

    pub fn halt_reason(&self) -> Option<String> {
        let book = self.book();
        book.breaker.halted.then(|| book.breaker.reason.clone())
    }

    pub fn get_position(&self, pair: &str) -> Option<Position> {
        self.book().positions.get(pair).cloned()
    }

    pub fn has_position(&self, pair: &str) -> bool {
        self.book().positions.contains_key(pair)
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.book().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.pair.cmp(&b.pair));
        positions
    }

    /// Same-day closes for `pair`, oldest first
    pub fn recent_closed(&self, pair: &str) -> Vec<ClosedPosition> {
        self.book()
            .recent_closed
            .iter()
            .filter(|c| c.pair == pair)
            .cloned()
            .collect()
    }

    pub fn ledger(&self) -> Ledger {
        self.book().ledger.clone()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let book = self.book();
        let mut positions: Vec<Position> = book.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.pair.cmp(&b.pair));
        EngineSnapshot {
            positions,
            recent_closed: book.recent_closed.clone(),
            ledger: book.ledger.clone(),
            lifetime: book.lifetime.clone(),
            circuit_breaker: book.breaker.clone(),
            taken_at: Utc::now(),
        }
    }

    pub fn exposure(&self) -> ExposureReport {
        let book = self.book();
        ExposureReport::from_positions(book.positions.values(), &self.config.exposure)
    }

    /// Whether adding `notional_eur` on `pair` would overload its correlation group
    pub fn would_exceed_group_limit(
        &self,
        pair: &str,
        notional_eur: f64,
        capital: f64,
    ) -> Option<String> {
        self.exposure()
            .would_exceed_group_limit(&self.config.exposure, pair, notional_eur, capital)
    }
}
