// =============================================================================
// Relay Copy Engine — Main Entry Point
// =============================================================================
//
// Signal intake starts Paused for safety. Operators resume it via
// POST /api/v1/control/resume once accounts and recorders are wired up.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod dispatch;
mod error;
mod events;
mod filters;
mod position_engine;
mod reconcile;
mod risk;
mod runtime_config;
mod signal;
mod store;
mod tokens;
mod types;
mod watcher;
mod workers;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::adapter::BrokerAdapter;
use crate::broker::pool::ConnectionPool;
use crate::broker::symbols::SymbolResolver;
use crate::broker::tradovate::TradovateClient;
use crate::dispatch::{Dispatcher, ExecutionQueue};
use crate::events::EventBus;
use crate::position_engine::PositionTracker;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::tokens::TokenCache;
use crate::types::TradingMode;
use crate::watcher::{BracketBook, LastPriceCache, PositionWatcher};
use crate::workers::ExecutionEngine;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Relay Copy Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    // SAFETY: signal intake always starts Paused.
    config.trading_mode = TradingMode::Paused;

    info!(
        workers = config.worker_pool_size,
        queue_capacity = config.queue_capacity,
        drawdown_tick_ms = config.drawdown_tick_ms,
        "Engine starting in SAFE mode (Paused)"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let store = Store::open(&config.db_path)?;

    // ── 3. Core subsystems ───────────────────────────────────────────────
    let bus = EventBus::new();
    let adapter: Arc<dyn BrokerAdapter> =
        Arc::new(TradovateClient::new(config.default_broker_timeout_ms));
    let tokens = Arc::new(TokenCache::new(
        store.clone(),
        adapter.clone(),
        bus.clone(),
        config.token_refresh_skew_seconds,
    ));
    let pool = Arc::new(ConnectionPool::new(
        store.clone(),
        tokens.clone(),
        adapter.clone(),
    ));
    let symbols = Arc::new(SymbolResolver::new(Some(adapter.clone())));
    let tracker = Arc::new(PositionTracker::new(store.clone()));
    let queue = ExecutionQueue::new(config.queue_capacity);
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        queue.clone(),
        symbols.clone(),
        bus.clone(),
    ));
    let exec_engine = ExecutionEngine::new(
        queue.clone(),
        pool.clone(),
        adapter.clone(),
        store.clone(),
        bus.clone(),
    );
    let oracle = Arc::new(LastPriceCache::new());
    let bracket_book = Arc::new(BracketBook::new());

    let drain_cap_seconds = config.drain_cap_seconds;
    let worker_pool_size = config.worker_pool_size;
    let token_scan = config.token_scan_interval_seconds;
    let token_ahead = config.token_refresh_ahead_seconds;
    let keepalive_interval = config.keepalive_interval_seconds;
    let reconcile_interval = config.reconcile_interval_seconds;
    let drawdown_tick_ms = config.drawdown_tick_ms;
    let bind_addr = config.bind_addr.clone();

    let state = Arc::new(AppState::new(
        config,
        store.clone(),
        bus.clone(),
        tokens.clone(),
        pool.clone(),
        adapter.clone(),
        symbols,
        tracker.clone(),
        dispatcher.clone(),
        queue.clone(),
        exec_engine.clone(),
        oracle.clone(),
        bracket_book.clone(),
    ));

    // ── 4. Execution workers ─────────────────────────────────────────────
    let worker_handles = exec_engine.clone().spawn_workers(worker_pool_size);
    info!(count = worker_pool_size, "execution workers launched");

    // ── 5. Token refresh daemon ──────────────────────────────────────────
    tokio::spawn(tokens::run_refresh_daemon(
        tokens.clone(),
        token_scan,
        token_ahead,
    ));

    // ── 6. Session keep-alive daemon ─────────────────────────────────────
    tokio::spawn(broker::pool::run_keepalive_daemon(
        pool.clone(),
        keepalive_interval,
    ));

    // ── 7. Drawdown poller / bracket watcher ─────────────────────────────
    let position_watcher = Arc::new(PositionWatcher::new(
        store.clone(),
        oracle,
        bracket_book,
        tracker,
        dispatcher,
        bus.clone(),
    ));
    tokio::spawn(position_watcher.run(drawdown_tick_ms));

    // ── 8. Reconciliation audit loop ─────────────────────────────────────
    {
        let recon_state = state.clone();
        let recon_store = store.clone();
        let recon_pool = pool.clone();
        let recon_adapter = adapter.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(reconcile_interval.max(1)));
            loop {
                interval.tick().await;
                match reconcile::reconcile_once(&recon_store, &recon_pool, &recon_adapter).await {
                    Ok(_result) => {
                        *recon_state.last_reconcile_ok.write() = Some(std::time::Instant::now());
                        *recon_state.last_reconcile_error.write() = None;
                        recon_state.increment_version();
                    }
                    Err(e) => {
                        *recon_state.last_reconcile_error.write() = Some(format!("{e}"));
                        warn!(error = %e, "reconciliation failed");
                    }
                }
            }
        });
    }

    // ── 9. HTTP API server ───────────────────────────────────────────────
    {
        let api_state = state.clone();
        let addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %addr, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %addr, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // Stop accepting webhooks, then drain the execution queue under a cap.
    state
        .accepting_webhooks
        .store(false, std::sync::atomic::Ordering::Relaxed);
    queue.close();

    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
    };
    match tokio::time::timeout(
        tokio::time::Duration::from_secs(drain_cap_seconds),
        drain,
    )
    .await
    {
        Ok(()) => info!("execution queue drained"),
        Err(_) => warn!(
            cap_seconds = drain_cap_seconds,
            "drain cap hit — abandoning remaining tasks"
        ),
    }

    pool.clear();

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Relay Copy Engine shut down complete.");
    Ok(())
}
