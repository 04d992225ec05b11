// =============================================================================
// Execution Workers — bounded pool draining the partitioned order queue
// =============================================================================
//
// Each worker: dequeue a task (leasing its partition), obtain the pooled
// session for the task's subaccount, submit the parent market order with
// attached TP/SL children where applicable, persist the Trade row, and emit
// a trade_executed event.
//
// RETRY POLICY: none. Any rejection — broker error, timeout, empty ack,
// token failure — is logged, emitted as status=rejected, and the worker
// moves on. A trade row is only ever written for a successfully submitted
// order. This single policy is what rules out duplicate executions.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::adapter::{BrokerAdapter, OrderRequest, OrderType};
use crate::broker::pool::ConnectionPool;
use crate::broker::symbols::{tick_size_or_default, ticker_root};
use crate::dispatch::{ExecutionQueue, ExecutionTask};
use crate::error::BrokerError;
use crate::events::{EngineEvent, EventBus};
use crate::store::{Store, TradeRow, TradeStatus};
use crate::types::SlType;
use crate::watcher::{offset_points, sl_price, tp_price};

/// Ties the order queue to the broker session pool and the trade journal.
pub struct ExecutionEngine {
    queue: Arc<ExecutionQueue>,
    pool: Arc<ConnectionPool>,
    adapter: Arc<dyn BrokerAdapter>,
    store: Store,
    bus: EventBus,
    /// Operator-visible counter of internal logic bugs (invariant hits).
    invariant_violations: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(
        queue: Arc<ExecutionQueue>,
        pool: Arc<ConnectionPool>,
        adapter: Arc<dyn BrokerAdapter>,
        store: Store,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            pool,
            adapter,
            store,
            bus,
            invariant_violations: AtomicU64::new(0),
        })
    }

    pub fn invariant_violation_count(&self) -> u64 {
        self.invariant_violations.load(Ordering::Relaxed)
    }

    /// Spawn `n` workers. Each exits when the queue is closed and drained.
    pub fn spawn_workers(self: Arc<Self>, n: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..n.max(1))
            .map(|worker_id| {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.worker_loop(worker_id).await;
                })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "execution worker started");
        while let Some((task, lease)) = self.queue.pop().await {
            self.execute(task).await;
            drop(lease);
        }
        debug!(worker_id, "execution worker stopped — queue closed and drained");
    }

    /// Execute one task: exactly one submission attempt.
    pub async fn execute(&self, task: ExecutionTask) {
        if task.quantity <= 0 {
            self.invariant_violations.fetch_add(1, Ordering::Relaxed);
            error!(
                correlation_id = %task.correlation_id,
                quantity = task.quantity,
                "FATAL: non-positive task quantity — dropping task"
            );
            self.bus.log(
                "fatal",
                "workers",
                "invariant violation: non-positive task quantity",
                serde_json::json!({ "correlation_id": task.correlation_id }),
            );
            return;
        }

        let session = match self.pool.session(task.subaccount_id).await {
            Ok(s) => s,
            Err(e) => {
                self.reject(&task, &e);
                return;
            }
        };
        let token = match session.access_token().await {
            Ok(t) => t,
            Err(e) => {
                self.reject(&task, &e);
                return;
            }
        };

        let parent = OrderRequest {
            broker_account_id: session.broker_account_id,
            contract: task.contract.clone(),
            action: task.action,
            qty: task.quantity,
            order_type: OrderType::Market,
            price: None,
            link_group: None,
        };

        let (tp_trigger, sl_trigger) = self.native_bracket_prices(&task);
        let use_bracket_call = !task.closing
            && self.adapter.supports_native_brackets()
            && (tp_trigger.is_some() || sl_trigger.is_some());

        let result = if use_bracket_call {
            self.adapter
                .place_bracket(task.environment, &token, &parent, tp_trigger, sl_trigger)
                .await
                .map(|ids| (ids.parent, ids.tp_order_id, ids.sl_order_id))
        } else {
            self.adapter
                .place_order(task.environment, &token, &parent)
                .await
                .map(|placed| (placed, None, None))
        };

        match result {
            Ok((placed, tp_order_id, sl_order_id)) => {
                let status = if placed.fill_price.is_some() {
                    TradeStatus::Filled
                } else {
                    TradeStatus::Placed
                };
                let trade = TradeRow {
                    id: Uuid::new_v4().to_string(),
                    correlation_id: task.correlation_id.clone(),
                    trader_id: task.trader_id,
                    signal_id: task.signal_id.clone(),
                    symbol: task.ticker.clone(),
                    contract: task.contract.clone(),
                    side: task.action.to_string(),
                    quantity: task.quantity,
                    requested_price: Some(task.price),
                    fill_price: placed.fill_price,
                    broker_order_id: Some(placed.order_id.clone()),
                    tp_order_id,
                    sl_order_id,
                    status,
                    created_at: Utc::now().to_rfc3339(),
                };
                if let Err(e) = self.store.insert_trade(&trade).await {
                    error!(
                        correlation_id = %task.correlation_id,
                        error = %e,
                        "trade row insert failed after successful submission"
                    );
                }

                info!(
                    correlation_id = %task.correlation_id,
                    trader_id = task.trader_id,
                    contract = %task.contract,
                    action = %task.action,
                    qty = task.quantity,
                    broker_order_id = %placed.order_id,
                    closing = task.closing,
                    "order submitted"
                );
                self.bus.publish(EngineEvent::TradeExecuted {
                    correlation_id: task.correlation_id,
                    trader_id: task.trader_id,
                    symbol: task.ticker,
                    side: task.action.to_string(),
                    qty: task.quantity,
                    broker_order_id: Some(placed.order_id),
                    fill_price: placed.fill_price,
                    status,
                });
            }
            Err(e) => self.reject(&task, &e),
        }
    }

    /// Rejection path: log, emit, move on. No trade row, no retry.
    fn reject(&self, task: &ExecutionTask, err: &BrokerError) {
        warn!(
            correlation_id = %task.correlation_id,
            trader_id = task.trader_id,
            contract = %task.contract,
            kind = err.kind(),
            error = %err,
            "order submission rejected — not retrying"
        );
        self.bus.log(
            "error",
            "workers",
            format!("order rejected: {err}"),
            serde_json::json!({
                "correlation_id": task.correlation_id,
                "trader_id": task.trader_id,
                "kind": err.kind(),
            }),
        );
        self.bus.publish(EngineEvent::TradeExecuted {
            correlation_id: task.correlation_id.clone(),
            trader_id: task.trader_id,
            symbol: task.ticker.clone(),
            side: task.action.to_string(),
            qty: task.quantity,
            broker_order_id: None,
            fill_price: None,
            status: TradeStatus::Rejected,
        });
    }

    /// TP/SL trigger prices for native bracket submission. Ladder targets,
    /// trailing stops, and break-even stops stay with the local watcher.
    fn native_bracket_prices(&self, task: &ExecutionTask) -> (Option<Decimal>, Option<Decimal>) {
        if task.closing || task.bracket.is_empty() {
            return (None, None);
        }
        let tick = tick_size_or_default(&ticker_root(&task.ticker));

        let tp = task.bracket.tp.as_ref().map(|spec| {
            tp_price(
                task.price,
                task.side,
                offset_points(spec.value, spec.unit, task.price, tick),
            )
        });
        let sl = task
            .bracket
            .sl
            .as_ref()
            .filter(|spec| spec.sl_type == SlType::Fixed)
            .map(|spec| {
                sl_price(
                    task.price,
                    task.side,
                    offset_points(spec.value, spec.unit, task.price, tick),
                )
            });
        (tp, sl)
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("queue_depth", &self.queue.depth())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::adapter::mock::MockBroker;
    use crate::tokens::TokenCache;
    use crate::types::{Action, BracketSpec, Environment, OffsetUnit, Side, SlSpec, TpSpec};
    use rust_decimal_macros::dec;

    struct Fixture {
        engine: Arc<ExecutionEngine>,
        queue: Arc<ExecutionQueue>,
        mock: Arc<MockBroker>,
        store: Store,
        bus: EventBus,
        subaccount_id: i64,
        trader_id: i64,
    }

    async fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("ops", "x").await.unwrap();
        let recorder = store
            .insert_recorder(
                user,
                "r",
                "MNQ1!",
                1,
                1,
                false,
                &crate::filters::FilterConfig::default(),
                &BracketSpec::default(),
                None,
            )
            .await
            .unwrap();
        let account = store
            .insert_account(user, "apex", Environment::Demo, "cid", "secret")
            .await
            .unwrap();
        store
            .update_account_refresh_token(account, "rt-1", &Utc::now().to_rfc3339())
            .await
            .unwrap();
        let subaccount_id = store.insert_subaccount(account, 77001, "SIM-1").await.unwrap();
        let trader_id = store
            .insert_trader(recorder.id, subaccount_id, dec!(1), None, None)
            .await
            .unwrap();

        let mock = Arc::new(MockBroker::new());
        let bus = EventBus::new();
        let tokens = Arc::new(TokenCache::new(
            store.clone(),
            mock.clone(),
            bus.clone(),
            120,
        ));
        let pool = Arc::new(ConnectionPool::new(store.clone(), tokens, mock.clone()));
        let queue = ExecutionQueue::new(64);
        let engine = ExecutionEngine::new(
            queue.clone(),
            pool,
            mock.clone(),
            store.clone(),
            bus.clone(),
        );

        Fixture {
            engine,
            queue,
            mock,
            store,
            bus,
            subaccount_id,
            trader_id,
        }
    }

    fn task(f: &Fixture, seq: u64, bracket: BracketSpec, closing: bool) -> ExecutionTask {
        ExecutionTask {
            correlation_id: Uuid::new_v4().to_string(),
            trader_id: f.trader_id,
            subaccount_id: f.subaccount_id,
            signal_id: "sig-1".into(),
            ticker: "MNQ1!".into(),
            contract: "MNQM6".into(),
            environment: Environment::Demo,
            action: if closing { Action::Sell } else { Action::Buy },
            side: Side::Long,
            quantity: 2,
            price: dec!(25600),
            bracket,
            closing,
            position_id: "pos-1".into(),
            seq,
        }
    }

    #[tokio::test]
    async fn successful_submission_writes_trade_row_and_event() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe();

        f.queue.push(task(&f, 0, BracketSpec::default(), false)).unwrap();
        f.queue.close();
        for handle in f.engine.clone().spawn_workers(2) {
            handle.await.unwrap();
        }

        assert_eq!(f.mock.placed_count(), 1);
        let trades = f.store.list_recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].quantity, 2);
        assert!(trades[0].broker_order_id.is_some());

        // A trade_executed event with placed/filled status was published.
        loop {
            match rx.recv().await.unwrap() {
                EngineEvent::TradeExecuted { status, qty, .. } => {
                    assert_ne!(status, TradeStatus::Rejected);
                    assert_eq!(qty, 2);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn rejection_writes_no_trade_row_and_emits_rejected() {
        // A broker rejection must not fabricate trade history.
        let f = fixture().await;
        *f.mock.reject_orders.lock() = true;
        let mut rx = f.bus.subscribe();

        f.queue.push(task(&f, 0, BracketSpec::default(), false)).unwrap();
        f.queue.close();
        for handle in f.engine.clone().spawn_workers(1) {
            handle.await.unwrap();
        }

        assert_eq!(f.mock.placed_count(), 0);
        assert!(f.store.list_recent_trades(10).await.unwrap().is_empty());

        loop {
            match rx.recv().await.unwrap() {
                EngineEvent::TradeExecuted { status, broker_order_id, .. } => {
                    assert_eq!(status, TradeStatus::Rejected);
                    assert!(broker_order_id.is_none());
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn timeout_is_treated_as_rejection_no_retry() {
        let f = fixture().await;
        *f.mock.timeout_orders.lock() = true;

        f.queue.push(task(&f, 0, BracketSpec::default(), false)).unwrap();
        f.queue.close();
        for handle in f.engine.clone().spawn_workers(1) {
            handle.await.unwrap();
        }

        // Exactly one attempt reached the adapter (which timed out before
        // recording), and nothing was persisted.
        assert_eq!(f.mock.placed_count(), 0);
        assert!(f.store.list_recent_trades(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn opening_task_with_bracket_uses_native_oso() {
        let f = fixture().await;
        let bracket = BracketSpec {
            tp: Some(TpSpec {
                value: dec!(20),
                unit: OffsetUnit::Points,
            }),
            sl: Some(SlSpec {
                value: dec!(10),
                unit: OffsetUnit::Points,
                sl_type: SlType::Fixed,
            }),
            targets: Vec::new(),
        };

        f.queue.push(task(&f, 0, bracket, false)).unwrap();
        f.queue.close();
        for handle in f.engine.clone().spawn_workers(1) {
            handle.await.unwrap();
        }

        let trades = f.store.list_recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!(trades[0].tp_order_id.is_some(), "TP child linked");
        assert!(trades[0].sl_order_id.is_some(), "SL child linked");
    }

    #[tokio::test]
    async fn closing_task_never_attaches_brackets() {
        let f = fixture().await;
        let bracket = BracketSpec {
            tp: Some(TpSpec {
                value: dec!(20),
                unit: OffsetUnit::Points,
            }),
            ..Default::default()
        };

        f.queue.push(task(&f, 0, bracket, true)).unwrap();
        f.queue.close();
        for handle in f.engine.clone().spawn_workers(1) {
            handle.await.unwrap();
        }

        let trades = f.store.list_recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!(trades[0].tp_order_id.is_none());
        assert!(trades[0].sl_order_id.is_none());
        assert_eq!(trades[0].side, "sell");
    }

    #[tokio::test]
    async fn same_partition_tasks_execute_in_order() {
        let f = fixture().await;
        let mut t0 = task(&f, 0, BracketSpec::default(), true);
        t0.quantity = 5;
        let mut t1 = task(&f, 1, BracketSpec::default(), false);
        t1.quantity = 1;

        // Close enqueued before reverse-open: workers must preserve that.
        f.queue.push(t0).unwrap();
        f.queue.push(t1).unwrap();
        f.queue.close();
        for handle in f.engine.clone().spawn_workers(4) {
            handle.await.unwrap();
        }

        let placed = f.mock.placed.lock();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].qty, 5, "close first");
        assert_eq!(placed[1].qty, 1, "open second");
    }

    #[tokio::test]
    async fn non_positive_quantity_is_invariant_violation() {
        let f = fixture().await;
        let mut bad = task(&f, 0, BracketSpec::default(), false);
        bad.quantity = 0;

        f.queue.push(bad).unwrap();
        f.queue.close();
        for handle in f.engine.clone().spawn_workers(1) {
            handle.await.unwrap();
        }

        assert_eq!(f.engine.invariant_violation_count(), 1);
        assert_eq!(f.mock.placed_count(), 0);
    }
}
