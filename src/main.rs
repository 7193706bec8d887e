use ratchet_core::application::actors::journal_actor::JournalActor;
use ratchet_core::application::actors::pair_worker::PairRouter;
use ratchet_core::application::services::trading_core::TradingCore;
use ratchet_core::config::EngineConfig;
use ratchet_core::domain::events::EventBus;
use ratchet_core::domain::repositories::exchange_client::ExchangeClient;
use ratchet_core::domain::services::position_manager::PositionManager;
use ratchet_core::infrastructure::adapters::exchange_adapter::ExchangeAdapter;
use ratchet_core::infrastructure::kraken_client::KrakenClient;
use ratchet_core::infrastructure::price_feed::PriceFeed;
use ratchet_core::persistence::journal::EventJournal;
use ratchet_core::persistence::lock::{self, HistoryAccess};
use ratchet_core::persistence::state_store::JsonStateStore;
use ratchet_core::persistence::init_database;
use ratchet_core::secrets::ApiCredentials;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BREAKER_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const TICK_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ratchet_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(
        "Ratchet engine starting: pairs {:?}, exit mode {:?}, ghost mode {}",
        config.pairs, config.risk.exit_mode, config.trading.ghost_mode
    );

    // Book state first: it creates the state directory the lock lives in
    let store = Arc::new(JsonStateStore::new(&config.state_dir)?);
    let history = lock::acquire(config.state_dir.join("journal.lock"));
    let journal = match init_database(&config.journal_url, !history.is_writable()).await {
        Ok(pool) => Some(EventJournal::new(pool, "kraken", !history.is_writable())),
        Err(e) => {
            warn!("Event journal unavailable, events will only be logged: {}", e);
            None
        }
    };
    if let HistoryAccess::ReadOnly = history {
        warn!("Another process owns the event journal; this instance only reads history");
    }

    let events = EventBus::new();
    let journal_handle = JournalActor::spawn(journal, events.subscribe());
    let engine = Arc::new(PositionManager::with_store(
        config.risk.clone(),
        store,
        events.clone(),
    )?);

    let venue = Arc::new(KrakenClient::new(
        config.kraken.clone(),
        ApiCredentials::from_env_optional(),
    )?);
    let exchange: Arc<dyn ExchangeClient> =
        Arc::new(ExchangeAdapter::new(venue, config.adapter.clone()));
    if let Err(e) = exchange.connect().await {
        error!("Initial connect failed, continuing with lazy market data: {}", e);
    }

    let core = Arc::new(TradingCore::new(
        exchange.clone(),
        engine.clone(),
        config.trading.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);

    let feed_handle = tokio::spawn(PriceFeed::new(config.feed.clone()).run(tick_tx, shutdown_rx.clone()));
    let router_handle = PairRouter::spawn(core.clone(), tick_rx, shutdown_rx.clone());
    let supervision_handle = tokio::spawn(supervision_task(core.clone(), shutdown_rx));

    info!("Engine running with {} open position(s). Press Ctrl+C to stop.", engine.positions().len());
    shutdown_signal().await;
    info!("Shutting down gracefully...");

    if shutdown_tx.send(true).is_err() {
        warn!("Every task had already stopped");
    }
    for (name, handle) in [
        ("price feed", feed_handle),
        ("pair router", router_handle),
        ("supervision", supervision_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }

    let book = engine.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || book.flush()).await {
        error!("Final book save failed: {}", e);
    }

    // Last publishers go away so the journal drains and stops
    drop(core);
    drop(engine);
    drop(events);
    match journal_handle.await {
        Ok(stats) => info!("Journal flushed: {:?}", stats),
        Err(e) => error!("Journal task failed: {}", e),
    }
    drop(history);

    info!("Shutdown complete");
    Ok(())
}

/// Periodic drawdown evaluation and venue health logging
async fn supervision_task(core: Arc<TradingCore>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(BREAKER_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !core.exchange().is_healthy().await {
                    warn!("Exchange adapter reports unhealthy");
                }
                match core.evaluate_circuit_breaker().await {
                    Ok((true, reason)) => warn!("Trading halted: {}", reason),
                    Ok((false, _)) => {}
                    Err(e) => warn!("Circuit breaker evaluation skipped: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
