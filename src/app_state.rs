// =============================================================================
// Central Application State — Relay Copy Engine
// =============================================================================
//
// The engine aggregate. Owns the token cache, connection pool, signal
// store, and event bus, and is threaded through every subsystem as
// `Arc<AppState>` — there are no process-global singletons.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior
//     mutability.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::broker::adapter::BrokerAdapter;
use crate::broker::pool::{ConnectionPool, SessionHealth};
use crate::broker::symbols::SymbolResolver;
use crate::dispatch::{Dispatcher, ExecutionQueue};
use crate::events::EventBus;
use crate::position_engine::PositionTracker;
use crate::risk::SessionRiskState;
use crate::runtime_config::RuntimeConfig;
use crate::signal::DedupCache;
use crate::store::{PositionRow, Store};
use crate::tokens::{TokenCache, TokenHealth};
use crate::watcher::{BracketBook, LastPriceCache};
use crate::workers::ExecutionEngine;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent filter decisions to retain.
const MAX_RECENT_DECISIONS: usize = 100;

// =============================================================================
// Ring-buffer records
// =============================================================================

/// A recorded error event for the operator error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

/// Auditable record of one webhook's trip through the filter pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub id: String,
    pub recorder_id: i64,
    pub action: String,
    pub ticker: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set when the max-contracts filter capped the base quantity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformed_quantity: Option<i64>,
    pub dispatched: u32,
    pub created_at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Central application state shared across all async tasks via
/// `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing version counter, incremented on every
    /// meaningful state mutation.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Core subsystems ─────────────────────────────────────────────────
    pub store: Store,
    pub bus: EventBus,
    pub tokens: Arc<TokenCache>,
    pub pool: Arc<ConnectionPool>,
    pub adapter: Arc<dyn BrokerAdapter>,
    pub symbols: Arc<SymbolResolver>,
    pub tracker: Arc<PositionTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<ExecutionQueue>,
    pub exec_engine: Arc<ExecutionEngine>,
    pub session_risk: Arc<SessionRiskState>,
    pub oracle: Arc<LastPriceCache>,
    pub bracket_book: Arc<BracketBook>,

    // ── Webhook edge ────────────────────────────────────────────────────
    pub dedup: DedupCache,
    pub webhook_rate: crate::api::rate_limit::WebhookRateLimiter,
    /// Flipped off during shutdown: the edge answers but stops processing.
    pub accepting_webhooks: AtomicBool,

    // ── Operational status ──────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub recent_decisions: RwLock<Vec<DecisionRecord>>,
    pub last_reconcile_ok: RwLock<Option<std::time::Instant>>,
    pub last_reconcile_error: RwLock<Option<String>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        store: Store,
        bus: EventBus,
        tokens: Arc<TokenCache>,
        pool: Arc<ConnectionPool>,
        adapter: Arc<dyn BrokerAdapter>,
        symbols: Arc<SymbolResolver>,
        tracker: Arc<PositionTracker>,
        dispatcher: Arc<Dispatcher>,
        queue: Arc<ExecutionQueue>,
        exec_engine: Arc<ExecutionEngine>,
        oracle: Arc<LastPriceCache>,
        bracket_book: Arc<BracketBook>,
    ) -> Self {
        let dedup = DedupCache::new(config.dedup_window_seconds);
        let webhook_rate =
            crate::api::rate_limit::WebhookRateLimiter::new(config.webhook_rate_per_minute);
        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            store,
            bus,
            tokens,
            pool,
            adapter,
            symbols,
            tracker,
            dispatcher,
            queue,
            exec_engine,
            session_risk: Arc::new(SessionRiskState::new()),
            oracle,
            bracket_book,
            dedup,
            webhook_rate,
            accepting_webhooks: AtomicBool::new(true),
            recent_errors: RwLock::new(Vec::new()),
            recent_decisions: RwLock::new(Vec::new()),
            last_reconcile_ok: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error logging ───────────────────────────────────────────────────

    /// Record an error for the operator log (capped ring buffer) and
    /// mirror it onto the event bus.
    pub fn push_error(&self, msg: impl Into<String>, code: Option<String>) {
        let message = msg.into();
        let record = ErrorRecord {
            message: message.clone(),
            code: code.clone(),
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.bus.log(
            "error",
            "engine",
            message,
            serde_json::json!({ "code": code }),
        );
        self.increment_version();
    }

    // ── Decision audit ──────────────────────────────────────────────────

    /// Record a filter decision. The ring buffer is capped at
    /// [`MAX_RECENT_DECISIONS`].
    pub fn push_decision(&self, decision: DecisionRecord) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(decision);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        drop(decisions);
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of engine state for the
    /// REST `GET /api/v1/state` endpoint.
    pub async fn build_snapshot(&self) -> StateSnapshot {
        let config = self.runtime_config.read().clone();
        let open_positions = self.store.list_open_positions().await.unwrap_or_default();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            trading_mode: config.trading_mode.to_string(),
            accepting_webhooks: self.accepting_webhooks.load(Ordering::Relaxed),
            worker_pool_size: config.worker_pool_size,
            queue_depth: self.queue.depth(),
            pool_sessions: self.pool.health(),
            token_health: self.tokens.health(),
            watched_bracket_children: self.bracket_book.watched_count(),
            subscriber_count: self.bus.subscriber_count(),
            invariant_violations: self.exec_engine.invariant_violation_count(),
            open_positions,
            recent_decisions: self.recent_decisions.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            reconcile_last_ok_age_s: self.last_reconcile_ok.read().map(|t| t.elapsed().as_secs()),
            reconcile_last_error: self.last_reconcile_error.read().clone(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .field("queue_depth", &self.queue.depth())
            .finish()
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

// =============================================================================
// Test fixture
// =============================================================================

/// Wire a full engine over the mock broker and an in-memory store, for
/// webhook-pipeline and API tests.
#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::broker::adapter::mock::MockBroker;

    pub struct TestEngine {
        pub state: Arc<AppState>,
        pub mock: Arc<MockBroker>,
    }

    pub fn build(config: RuntimeConfig) -> TestEngine {
        let store = Store::open_in_memory().expect("in-memory store");
        let bus = EventBus::new();
        let mock = Arc::new(MockBroker::new());
        let adapter: Arc<dyn BrokerAdapter> = mock.clone();

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

        let state = Arc::new(AppState::new(
            config,
            store,
            bus,
            tokens,
            pool,
            adapter,
            symbols,
            tracker,
            dispatcher,
            queue,
            exec_engine,
            oracle,
            bracket_book,
        ));
        TestEngine { state, mock }
    }
}

/// Full engine state snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub trading_mode: String,
    pub accepting_webhooks: bool,
    pub worker_pool_size: usize,
    pub queue_depth: usize,
    pub pool_sessions: Vec<SessionHealth>,
    pub token_health: Vec<TokenHealth>,
    pub watched_bracket_children: usize,
    pub subscriber_count: usize,
    pub invariant_violations: u64,
    pub open_positions: Vec<PositionRow>,
    pub recent_decisions: Vec<DecisionRecord>,
    pub recent_errors: Vec<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_last_ok_age_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_last_error: Option<String>,
}
