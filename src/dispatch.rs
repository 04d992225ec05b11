// =============================================================================
// Fan-out Dispatcher — expands accepted signals into per-trader execution
// tasks on a bounded, partition-ordered queue
// =============================================================================
//
// Ordering contract: tasks for a given (trader, symbol) execute strictly
// FIFO — the queue hands a partition to at most one worker at a time.
// Across partitions, workers run freely in parallel. On a flip the close
// task is enqueued before the reverse-open task into the same partition, so
// partition FIFO preserves close-before-open per trader.
//
// Each task carries a fresh correlation UUID and is attempted exactly once.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::Notify;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::broker::symbols::SymbolResolver;
use crate::events::EventBus;
use crate::position_engine::PositionEffect;
use crate::store::{RecorderRow, SignalRow, Store};
use crate::types::{Action, BracketSpec, Environment, Side};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of broker work: a single trader's share of one position effect.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub correlation_id: String,
    pub trader_id: i64,
    pub subaccount_id: i64,
    pub signal_id: String,
    /// Root ticker as received ("MNQ1!").
    pub ticker: String,
    /// Resolved broker contract ("MNQM6").
    pub contract: String,
    pub environment: Environment,
    pub action: Action,
    pub side: Side,
    pub quantity: i64,
    /// Signal price — the bracket reference, not a limit.
    pub price: Decimal,
    pub bracket: BracketSpec,
    /// Close/trim tasks never attach brackets.
    pub closing: bool,
    pub position_id: String,
    /// Per-dispatch sequence for log correlation.
    pub seq: u64,
}

type PartitionKey = (i64, String);

// ---------------------------------------------------------------------------
// Bounded partitioned queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    Full,
    Closed,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "execution queue full"),
            Self::Closed => write!(f, "execution queue closed"),
        }
    }
}

struct QueueInner {
    partitions: HashMap<PartitionKey, VecDeque<ExecutionTask>>,
    /// Partitions holding tasks and not currently leased to a worker.
    ready: VecDeque<PartitionKey>,
    /// Partitions a worker is currently executing from.
    busy: HashSet<PartitionKey>,
    len: usize,
    closed: bool,
}

/// Bounded multi-partition FIFO. `pop` leases a partition to the caller;
/// dropping the lease returns the partition to the ready set.
pub struct ExecutionQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

/// Exclusive claim on a partition while one of its tasks executes.
/// Dropping the lease returns the partition to the ready set.
pub struct PartitionLease<'a> {
    queue: &'a ExecutionQueue,
    key: Option<PartitionKey>,
}

impl Drop for PartitionLease<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.queue.release(key);
        }
    }
}

impl ExecutionQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                partitions: HashMap::new(),
                ready: VecDeque::new(),
                busy: HashSet::new(),
                len: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    pub fn push(&self, task: ExecutionTask) -> Result<(), EnqueueError> {
        let key = (task.trader_id, task.ticker.clone());
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(EnqueueError::Closed);
        }
        if inner.len >= self.capacity {
            return Err(EnqueueError::Full);
        }

        let newly_ready = !inner.partitions.contains_key(&key) && !inner.busy.contains(&key);
        inner.partitions.entry(key.clone()).or_default().push_back(task);
        inner.len += 1;
        if newly_ready {
            inner.ready.push_back(key);
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next task from any ready partition, leasing that partition.
    /// Returns None once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<(ExecutionTask, PartitionLease<'_>)> {
        loop {
            {
                let mut inner = self.inner.lock();
                while let Some(key) = inner.ready.pop_front() {
                    let task = inner
                        .partitions
                        .get_mut(&key)
                        .and_then(|q| q.pop_front());
                    match task {
                        Some(task) => {
                            if inner
                                .partitions
                                .get(&key)
                                .map(|q| q.is_empty())
                                .unwrap_or(true)
                            {
                                inner.partitions.remove(&key);
                            }
                            inner.busy.insert(key.clone());
                            inner.len -= 1;
                            let more_ready = !inner.ready.is_empty();
                            drop(inner);
                            if more_ready {
                                // Cascade the wakeup to another idle worker.
                                self.notify.notify_one();
                            }
                            return Some((
                                task,
                                PartitionLease {
                                    queue: self,
                                    key: Some(key),
                                },
                            ));
                        }
                        None => {
                            inner.partitions.remove(&key);
                        }
                    }
                }
                if inner.closed && inner.len == 0 {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn release(&self, key: PartitionKey) {
        let mut inner = self.inner.lock();
        inner.busy.remove(&key);
        let has_tasks = inner
            .partitions
            .get(&key)
            .map(|q| !q.is_empty())
            .unwrap_or(false);
        if has_tasks {
            inner.ready.push_back(key);
            drop(inner);
            self.notify.notify_one();
        } else if inner.closed && inner.len == 0 {
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// Stop accepting tasks; workers drain what remains and then see None.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().len
    }
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ExecutionQueue")
            .field("len", &inner.len)
            .field("busy", &inner.busy.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Quantity scaling
// ---------------------------------------------------------------------------

/// `round_half_up(base · multiplier)`, minimum 1.
pub fn scale_quantity(base: i64, multiplier: Decimal) -> i64 {
    let scaled = (Decimal::from(base) * multiplier)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(1);
    scaled.max(1)
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Expands each position effect of an accepted signal into one task per
/// enabled trader.
pub struct Dispatcher {
    store: Store,
    queue: Arc<ExecutionQueue>,
    symbols: Arc<SymbolResolver>,
    bus: EventBus,
    seq: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        queue: Arc<ExecutionQueue>,
        symbols: Arc<SymbolResolver>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            symbols,
            bus,
            seq: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    /// Fan the effects of an accepted signal out.
    pub async fn dispatch(
        &self,
        recorder: &RecorderRow,
        signal: &SignalRow,
        effects: &[PositionEffect],
    ) -> Result<u32> {
        self.dispatch_effects(recorder, &signal.id, &signal.ticker, signal.price, effects)
            .await
    }

    /// Fan out effects from any origin (signals, or the bracket watcher
    /// firing a trim/close). Returns how many tasks were enqueued.
    pub async fn dispatch_effects(
        &self,
        recorder: &RecorderRow,
        origin_id: &str,
        ticker: &str,
        price: Decimal,
        effects: &[PositionEffect],
    ) -> Result<u32> {
        let targets = self.store.list_enabled_trader_targets(recorder.id).await?;
        if targets.is_empty() {
            debug!(recorder_id = recorder.id, "no enabled traders — nothing to dispatch");
            return Ok(0);
        }

        let now = Utc::now();
        let mut dispatched = 0u32;

        for effect in effects {
            let (side, position_id, closing) = match effect {
                PositionEffect::Open { position_id, side, .. }
                | PositionEffect::Add { position_id, side, .. } => {
                    (*side, position_id.clone(), false)
                }
                PositionEffect::Close { position_id, side, .. }
                | PositionEffect::Trim { position_id, side, .. } => {
                    (*side, position_id.clone(), true)
                }
                PositionEffect::NoOp => continue,
            };
            let base_quantity = effect.base_quantity();
            let action = if closing {
                side.exit_action()
            } else {
                side.entry_action()
            };

            for target in &targets {
                let contract = self
                    .symbols
                    .resolve(ticker, target.environment, now)
                    .await;

                let mut quantity = scale_quantity(base_quantity, target.multiplier);
                // The contract cap applies after fan-out scaling; the
                // trader's own override tightens it further.
                if let Some(cap) = recorder.filters.max_contracts_per_trade {
                    quantity = quantity.min(cap.max(1));
                }
                if let Some(cap) = target.max_contracts_override {
                    quantity = quantity.min(cap.max(1));
                }

                let bracket = if closing {
                    BracketSpec::default()
                } else {
                    target
                        .bracket_override
                        .clone()
                        .unwrap_or_else(|| recorder.bracket.clone())
                };

                let task = ExecutionTask {
                    correlation_id: Uuid::new_v4().to_string(),
                    trader_id: target.trader_id,
                    subaccount_id: target.subaccount_id,
                    signal_id: origin_id.to_string(),
                    ticker: ticker.to_string(),
                    contract,
                    environment: target.environment,
                    action,
                    side,
                    quantity,
                    price,
                    bracket,
                    closing,
                    position_id: position_id.clone(),
                    seq: self.seq.fetch_add(1, Ordering::SeqCst),
                };

                let correlation_id = task.correlation_id.clone();
                match self.queue.push(task) {
                    Ok(()) => {
                        dispatched += 1;
                        debug!(
                            correlation_id = %correlation_id,
                            trader_id = target.trader_id,
                            quantity,
                            action = %action,
                            closing,
                            "execution task enqueued"
                        );
                    }
                    Err(e) => {
                        error!(
                            trader_id = target.trader_id,
                            origin_id,
                            error = %e,
                            "task dropped — execution queue unavailable"
                        );
                        self.bus.log(
                            "error",
                            "dispatch",
                            format!("task dropped: {e}"),
                            serde_json::json!({
                                "trader_id": target.trader_id,
                                "origin_id": origin_id,
                            }),
                        );
                    }
                }
            }
        }

        if dispatched > 0 {
            info!(
                recorder_id = recorder.id,
                origin_id,
                dispatched,
                traders = targets.len(),
                "effects fanned out"
            );
        }
        Ok(dispatched)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_depth", &self.queue.depth())
            .finish()
    }
}
