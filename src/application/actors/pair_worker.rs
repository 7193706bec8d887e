//! One ordered worker per trading pair.
//!
//! The router fans ticks out to a dedicated task per pair. Ticks for the
//! same pair are handled strictly in arrival order; different pairs run in
//! parallel and a slow pair never holds up the others.

use crate::application::services::trading_core::TradingCore;
use crate::infrastructure::price_feed::PriceTick;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const PAIR_QUEUE_CAPACITY: usize = 64;

#[async_trait]
pub trait TickHandler: Send + Sync {
    async fn handle_tick(&self, tick: PriceTick);
}

#[async_trait]
impl TickHandler for TradingCore {
    async fn handle_tick(&self, tick: PriceTick) {
        match self.on_quote(&tick.pair, &tick.ticker).await {
            Ok(Some(outcome)) => info!(
                "{} exit {} on {}: {:+.2}% ({:+.2} EUR)",
                if outcome.decision.is_full_exit() { "Full" } else { "Partial" },
                outcome.decision.reason,
                tick.pair,
                outcome.realized.pnl_pct,
                outcome.realized.pnl_eur.value()
            ),
            Ok(None) => {}
            Err(e) => warn!("Tick on {} not processed: {}", tick.pair, e),
        }
    }
}

pub struct PairWorker<H: TickHandler + 'static> {
    pair: String,
    handler: Arc<H>,
}

impl<H: TickHandler + 'static> PairWorker<H> {
    pub fn spawn(pair: String, handler: Arc<H>) -> (mpsc::Sender<PriceTick>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(PAIR_QUEUE_CAPACITY);
        let worker = Self { pair, handler };
        let handle = tokio::spawn(async move {
            worker.run(rx).await;
        });
        (tx, handle)
    }

    async fn run(self, mut rx: mpsc::Receiver<PriceTick>) {
        debug!("Pair worker {} started", self.pair);
        while let Some(tick) = rx.recv().await {
            self.handler.handle_tick(tick).await;
        }
        debug!("Pair worker {} stopped", self.pair);
    }
}

/// Dispatches ticks to per-pair workers, spawning them on first sight
pub struct PairRouter<H: TickHandler + 'static> {
    handler: Arc<H>,
    workers: HashMap<String, (mpsc::Sender<PriceTick>, JoinHandle<()>)>,
}

impl<H: TickHandler + 'static> PairRouter<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            workers: HashMap::new(),
        }
    }

    pub fn spawn(
        handler: Arc<H>,
        ticks: mpsc::Receiver<PriceTick>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let router = Self::new(handler);
        tokio::spawn(async move {
            router.run(ticks, shutdown).await;
        })
    }

    /// Hand `tick` to its pair's queue without waiting
    pub fn route(&mut self, tick: PriceTick) {
        let handler = &self.handler;
        let (tx, _) = self
            .workers
            .entry(tick.pair.clone())
            .or_insert_with(|| PairWorker::spawn(tick.pair.clone(), handler.clone()));

        match tx.try_send(tick) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(tick)) => {
                // the next tick carries a fresher price
                warn!("Tick queue for {} full, dropping tick", tick.pair);
            }
            Err(mpsc::error::TrySendError::Closed(tick)) => {
                error!("Worker for {} is gone, respawning", tick.pair);
                let pair = tick.pair.clone();
                let (tx, handle) = PairWorker::spawn(pair.clone(), self.handler.clone());
                if tx.try_send(tick).is_err() {
                    warn!("Could not hand tick to respawned worker for {}", pair);
                }
                self.workers.insert(pair, (tx, handle));
            }
        }
    }

    pub fn pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self.workers.keys().cloned().collect();
        pairs.sort();
        pairs
    }

    /// Route until the feed ends or shutdown flips, then drain every worker
    pub async fn run(mut self, mut ticks: mpsc::Receiver<PriceTick>, mut shutdown: watch::Receiver<bool>) {
        info!("Pair router started");
        loop {
            tokio::select! {
                tick = ticks.recv() => match tick {
                    Some(tick) => self.route(tick),
                    None => break,
                },
                changed = shutdown.changed() => {
                    // a dropped sender counts as shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// Close every queue and wait for in-flight ticks to finish
    pub async fn shutdown(self) {
        for (pair, (tx, handle)) in self.workers {
            drop(tx);
            if let Err(e) = handle.await {
                error!("Pair worker {} panicked: {}", pair, e);
            }
        }
        info!("Pair router stopped");
    }
}
