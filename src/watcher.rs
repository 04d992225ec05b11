// =============================================================================
// Position Watcher — periodic drawdown polling and local bracket evaluation
// =============================================================================
//
// Runs as a background Tokio task waking once per tick (default 1 s) to:
//   1. Fetch the last price for every open position via the PriceOracle.
//   2. Update current_price, unrealized P&L, and the worst/best running
//      extremes on each position row.
//   3. Evaluate locally-attached TP/SL children (trailing stops, break-even
//      stops, TP ladders, and plain brackets when the broker lacks native
//      linking). A fired child submits its closing order through the same
//      dispatch path as a signal — one attempt, never retried.
//   4. Broadcast position, strategy, and account P&L events.
//
// Child life-cycle: Pending -> Fired -> (BrokerAck | BrokerReject).
// Pending is the only state a child can fire from.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::symbols::{tick_size_or_default, ticker_root};
use crate::dispatch::Dispatcher;
use crate::events::{EngineEvent, EventBus};
use crate::position_engine::{unrealized_pnl, PositionEffect, PositionTracker};
use crate::risk::session_day_start;
use crate::store::{PositionRow, Store};
use crate::types::{BracketSpec, Side, SlType};

// ---------------------------------------------------------------------------
// Price oracle
// ---------------------------------------------------------------------------

/// Opaque source of last prices, keyed by ticker.
pub trait PriceOracle: Send + Sync {
    fn last_price(&self, ticker: &str) -> Option<Decimal>;
}

/// Last-price cache fed by webhook signal prices and broker quotes.
pub struct LastPriceCache {
    prices: RwLock<HashMap<String, Decimal>>,
}

impl LastPriceCache {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, ticker: &str, price: Decimal) {
        self.prices.write().insert(ticker.to_string(), price);
    }
}

impl Default for LastPriceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceOracle for LastPriceCache {
    fn last_price(&self, ticker: &str) -> Option<Decimal> {
        self.prices.read().get(ticker).copied()
    }
}

// ---------------------------------------------------------------------------
// Offset arithmetic
// ---------------------------------------------------------------------------

/// Convert a TP/SL distance to price points.
pub fn offset_points(
    value: Decimal,
    unit: crate::types::OffsetUnit,
    entry: Decimal,
    tick: Decimal,
) -> Decimal {
    match unit {
        crate::types::OffsetUnit::Points => value,
        crate::types::OffsetUnit::Ticks => value * tick,
        crate::types::OffsetUnit::Percent => entry * value / Decimal::from(100),
    }
}

/// Take-profit trigger: entry moved in the position's favour.
pub fn tp_price(entry: Decimal, side: Side, offset: Decimal) -> Decimal {
    entry + side.sign() * offset
}

/// Stop-loss trigger: entry moved against the position.
pub fn sl_price(entry: Decimal, side: Side, offset: Decimal) -> Decimal {
    entry - side.sign() * offset
}

// ---------------------------------------------------------------------------
// Bracket children
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    Pending,
    Fired,
    BrokerAck,
    BrokerReject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    TakeProfit,
    StopLoss,
}

/// One locally-watched TP or SL attached to a position.
#[derive(Debug, Clone, Serialize)]
pub struct BracketChild {
    pub id: String,
    pub position_id: String,
    pub kind: ChildKind,
    pub state: ChildState,
    pub side: Side,
    /// Current trigger price (ratchets for trailing stops).
    pub trigger: Decimal,
    /// Offset distance in points.
    pub distance: Decimal,
    /// Entry price at attach time (break-even target).
    pub entry: Decimal,
    /// Best favourable price seen since attach.
    pub best: Decimal,
    /// Stop behaviour; TakeProfit children ignore this.
    pub sl_type: SlType,
    /// Break-even stops move to entry only after arming.
    pub armed: bool,
    /// Percentage of quantity to trim; None means full close.
    pub trim_pct: Option<u32>,
}

impl BracketChild {
    /// Update trailing/arming state for a new price and report whether the
    /// child fires. Only Pending children may fire.
    fn evaluate(&mut self, price: Decimal) -> bool {
        if self.state != ChildState::Pending {
            return false;
        }

        let favourable = (price - self.entry) * self.side.sign();

        if self.kind == ChildKind::StopLoss {
            match self.sl_type {
                SlType::Trailing => {
                    let improved = (price - self.best) * self.side.sign() > Decimal::ZERO;
                    if improved {
                        self.best = price;
                        self.trigger = sl_price(price, self.side, self.distance);
                        debug!(
                            child_id = %self.id,
                            trigger = %self.trigger,
                            "trailing stop ratcheted"
                        );
                    }
                }
                SlType::BreakEven => {
                    if !self.armed && favourable >= self.distance {
                        self.armed = true;
                        self.trigger = self.entry;
                        debug!(child_id = %self.id, "break-even stop armed at entry");
                    }
                }
                SlType::Fixed => {}
            }
        }

        let hit = match self.kind {
            ChildKind::TakeProfit => (price - self.trigger) * self.side.sign() >= Decimal::ZERO,
            ChildKind::StopLoss => (self.trigger - price) * self.side.sign() >= Decimal::ZERO,
        };
        if hit {
            self.state = ChildState::Fired;
        }
        hit
    }
}

/// Registry of locally-watched children, keyed by position id.
pub struct BracketBook {
    children: RwLock<HashMap<String, Vec<BracketChild>>>,
}

impl BracketBook {
    pub fn new() -> Self {
        Self {
            children: RwLock::new(HashMap::new()),
        }
    }

    /// Attach the locally-watched children implied by a bracket spec.
    /// Plain TP/SL attach only when the broker lacks native linking;
    /// ladders, trailing stops, and break-even stops are always local.
    pub fn attach_from_spec(
        &self,
        position: &PositionRow,
        bracket: &BracketSpec,
        native_brackets: bool,
    ) {
        if bracket.is_empty() {
            return;
        }
        let tick = tick_size_or_default(&ticker_root(&position.ticker));
        let entry = position.avg_entry_price;
        let side = position.side;
        let mut attached = Vec::new();

        for target in &bracket.targets {
            let offset = offset_points(target.value, target.unit, entry, tick);
            attached.push(BracketChild {
                id: Uuid::new_v4().to_string(),
                position_id: position.id.clone(),
                kind: ChildKind::TakeProfit,
                state: ChildState::Pending,
                side,
                trigger: tp_price(entry, side, offset),
                distance: offset,
                entry,
                best: entry,
                sl_type: SlType::Fixed,
                armed: false,
                trim_pct: Some(target.trim_pct.min(100)),
            });
        }

        if let Some(tp) = &bracket.tp {
            if !native_brackets {
                let offset = offset_points(tp.value, tp.unit, entry, tick);
                attached.push(BracketChild {
                    id: Uuid::new_v4().to_string(),
                    position_id: position.id.clone(),
                    kind: ChildKind::TakeProfit,
                    state: ChildState::Pending,
                    side,
                    trigger: tp_price(entry, side, offset),
                    distance: offset,
                    entry,
                    best: entry,
                    sl_type: SlType::Fixed,
                    armed: false,
                    trim_pct: None,
                });
            }
        }

        if let Some(sl) = &bracket.sl {
            let local = sl.sl_type != SlType::Fixed || !native_brackets;
            if local {
                let offset = offset_points(sl.value, sl.unit, entry, tick);
                attached.push(BracketChild {
                    id: Uuid::new_v4().to_string(),
                    position_id: position.id.clone(),
                    kind: ChildKind::StopLoss,
                    state: ChildState::Pending,
                    side,
                    trigger: sl_price(entry, side, offset),
                    distance: offset,
                    entry,
                    best: entry,
                    sl_type: sl.sl_type,
                    armed: false,
                    trim_pct: None,
                });
            }
        }

        if !attached.is_empty() {
            info!(
                position_id = %position.id,
                count = attached.len(),
                "bracket children attached for local watching"
            );
            self.children
                .write()
                .entry(position.id.clone())
                .or_default()
                .extend(attached);
        }
    }

    /// Evaluate all Pending children of a position against a price.
    /// Children that fire transition to Fired and are returned.
    pub fn evaluate(&self, position_id: &str, price: Decimal) -> Vec<BracketChild> {
        let mut map = self.children.write();
        let Some(children) = map.get_mut(position_id) else {
            return Vec::new();
        };
        children
            .iter_mut()
            .filter_map(|c| if c.evaluate(price) { Some(c.clone()) } else { None })
            .collect()
    }

    /// Record the submission outcome of a fired child.
    pub fn set_result(&self, position_id: &str, child_id: &str, acked: bool) {
        if let Some(children) = self.children.write().get_mut(position_id) {
            if let Some(child) = children.iter_mut().find(|c| c.id == child_id) {
                child.state = if acked {
                    ChildState::BrokerAck
                } else {
                    ChildState::BrokerReject
                };
            }
        }
    }

    /// Drop every child of a closed position.
    pub fn remove_position(&self, position_id: &str) {
        self.children.write().remove(position_id);
    }

    pub fn watched_count(&self) -> usize {
        self.children.read().values().map(|v| v.len()).sum()
    }
}

impl Default for BracketBook {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Watcher service
// ---------------------------------------------------------------------------

/// The periodic drawdown/bracket service. Construct once and spawn
/// [`run`](Self::run).
pub struct PositionWatcher {
    store: Store,
    oracle: Arc<dyn PriceOracle>,
    book: Arc<BracketBook>,
    tracker: Arc<PositionTracker>,
    dispatcher: Arc<Dispatcher>,
    bus: EventBus,
}

impl PositionWatcher {
    pub fn new(
        store: Store,
        oracle: Arc<dyn PriceOracle>,
        book: Arc<BracketBook>,
        tracker: Arc<PositionTracker>,
        dispatcher: Arc<Dispatcher>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            oracle,
            book,
            tracker,
            dispatcher,
            bus,
        }
    }

    /// Run forever at the configured tick.
    pub async fn run(self: Arc<Self>, tick_ms: u64) {
        info!(tick_ms, "position watcher started");
        let mut ticker = interval(Duration::from_millis(tick_ms.max(100)));
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "watcher tick failed");
            }
        }
    }

    /// One full pass: marks, brackets, P&L events.
    pub async fn tick(&self) -> Result<()> {
        let positions = self.store.list_open_positions().await?;
        if positions.is_empty() {
            return Ok(());
        }

        let mut unrealized_by_recorder: HashMap<i64, Decimal> = HashMap::new();

        for position in &positions {
            let Some(price) = self.oracle.last_price(&position.ticker) else {
                debug!(ticker = %position.ticker, "no last price — skipping mark update");
                continue;
            };

            let unrealized = unrealized_pnl(
                position.avg_entry_price,
                price,
                position.total_quantity,
                position.point_value,
                position.side,
            );
            let worst = position.worst_unrealized_pnl.min(unrealized);
            let best = position.best_unrealized_pnl.max(unrealized);

            self.store
                .update_position_marks(&position.id, price, unrealized, worst, best)
                .await?;

            self.bus.publish(EngineEvent::PositionUpdate {
                recorder_id: position.recorder_id,
                ticker: position.ticker.clone(),
                side: position.side,
                qty: position.total_quantity,
                avg_price: position.avg_entry_price,
                status: position.status,
                unrealized_pnl: unrealized,
                worst_unrealized_pnl: worst,
            });

            *unrealized_by_recorder
                .entry(position.recorder_id)
                .or_default() += unrealized;

            for child in self.book.evaluate(&position.id, price) {
                self.fire_child(position, &child, price).await;
            }
        }

        self.publish_pnl(&unrealized_by_recorder).await?;
        Ok(())
    }

    /// Submit the closing/trimming order for a fired child through the
    /// normal dispatch path (exactly one attempt).
    async fn fire_child(&self, position: &PositionRow, child: &BracketChild, price: Decimal) {
        let Ok(Some(recorder)) = self.store.get_recorder(position.recorder_id).await else {
            warn!(position_id = %position.id, "fired child for unknown recorder");
            self.book.set_result(&position.id, &child.id, false);
            return;
        };

        info!(
            position_id = %position.id,
            child_id = %child.id,
            kind = ?child.kind,
            trigger = %child.trigger,
            price = %price,
            "bracket child fired"
        );

        let effect = match (child.kind, child.trim_pct) {
            (ChildKind::TakeProfit, Some(pct)) if pct < 100 => {
                let trim_qty = (position.total_quantity * pct as i64) / 100;
                match self.tracker.apply_trim(position, trim_qty.max(1), price).await {
                    Ok(effect) => effect,
                    Err(e) => {
                        warn!(position_id = %position.id, error = %e, "trim failed");
                        None
                    }
                }
            }
            _ => match self.tracker.apply_watcher_close(position, price).await {
                Ok(effect) => effect,
                Err(e) => {
                    warn!(position_id = %position.id, error = %e, "watcher close failed");
                    None
                }
            },
        };

        let Some(effect) = effect else {
            self.book.set_result(&position.id, &child.id, false);
            return;
        };

        let closed = matches!(effect, PositionEffect::Close { .. });
        let origin = format!("bracket:{}", child.id);
        let dispatched = self
            .dispatcher
            .dispatch_effects(&recorder, &origin, &position.ticker, price, &[effect])
            .await
            .unwrap_or(0);

        self.book
            .set_result(&position.id, &child.id, dispatched > 0);
        if closed {
            self.book.remove_position(&position.id);
            self.bus.publish(EngineEvent::PositionUpdate {
                recorder_id: position.recorder_id,
                ticker: position.ticker.clone(),
                side: position.side,
                qty: 0,
                avg_price: position.avg_entry_price,
                status: crate::store::PositionStatus::Closed,
                unrealized_pnl: Decimal::ZERO,
                worst_unrealized_pnl: position.worst_unrealized_pnl.min(Decimal::ZERO),
            });
        }
    }

    /// Per-recorder and per-account P&L events.
    async fn publish_pnl(&self, unrealized_by_recorder: &HashMap<i64, Decimal>) -> Result<()> {
        let now = chrono::Utc::now();
        let mut realized_by_recorder: HashMap<i64, Decimal> = HashMap::new();

        for (&recorder_id, &unrealized) in unrealized_by_recorder {
            let Some(recorder) = self.store.get_recorder(recorder_id).await? else {
                continue;
            };
            let day_start = session_day_start(now, recorder.filters.session_offset_minutes());
            let realized = self.store.realized_pnl_since(recorder_id, &day_start).await?;
            realized_by_recorder.insert(recorder_id, realized);

            self.bus.publish(EngineEvent::StrategyPnlUpdate {
                recorder_id,
                realized_today: realized,
                unrealized_total: unrealized,
            });
        }

        // Account-level view: each recorder's figures scaled by the linked
        // trader multipliers.
        let links = self.store.list_account_trader_links().await?;
        let mut per_account: HashMap<i64, (Decimal, Decimal)> = HashMap::new();
        for (account_id, recorder_id, multiplier) in links {
            let unrealized = unrealized_by_recorder
                .get(&recorder_id)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let realized = realized_by_recorder
                .get(&recorder_id)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let entry = per_account.entry(account_id).or_default();
            entry.0 += realized * multiplier;
            entry.1 += unrealized * multiplier;
        }
        for (account_id, (realized_today, unrealized_total)) in per_account {
            self.bus.publish(EngineEvent::PnlUpdate {
                account_id,
                realized_today,
                unrealized_total,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for PositionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionWatcher")
            .field("watched_children", &self.book.watched_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::symbols::SymbolResolver;
    use crate::dispatch::ExecutionQueue;
    use crate::filters::FilterConfig;
    use crate::position_engine::Sizing;
    use crate::store::PositionStatus;
    use crate::types::{Action, OffsetUnit, SlSpec, TpSpec, TpTarget};
    use rust_decimal_macros::dec;

    fn open_position(qty: i64, avg: Decimal, side: Side) -> PositionRow {
        PositionRow {
            id: "pos-1".into(),
            recorder_id: 1,
            ticker: "MNQ1!".into(),
            side,
            total_quantity: qty,
            avg_entry_price: avg,
            current_price: Some(avg),
            unrealized_pnl: Decimal::ZERO,
            worst_unrealized_pnl: Decimal::ZERO,
            best_unrealized_pnl: Decimal::ZERO,
            point_value: dec!(2),
            status: PositionStatus::Open,
            opened_at: "2026-03-04T14:30:00+00:00".into(),
            closed_at: None,
            exit_price: None,
            realized_pnl: Decimal::ZERO,
        }
    }

    #[test]
    fn offset_units_convert_to_points() {
        // 20 ticks on MNQ (0.25/tick) = 5 points.
        assert_eq!(offset_points(dec!(20), OffsetUnit::Ticks, dec!(25600), dec!(0.25)), dec!(5));
        assert_eq!(offset_points(dec!(15), OffsetUnit::Points, dec!(25600), dec!(0.25)), dec!(15));
        // 1% of 25600 = 256 points.
        assert_eq!(offset_points(dec!(1), OffsetUnit::Percent, dec!(25600), dec!(0.25)), dec!(256));
    }

    #[test]
    fn tp_and_sl_triggers_mirror_by_side() {
        assert_eq!(tp_price(dec!(100), Side::Long, dec!(10)), dec!(110));
        assert_eq!(sl_price(dec!(100), Side::Long, dec!(10)), dec!(90));
        assert_eq!(tp_price(dec!(100), Side::Short, dec!(10)), dec!(90));
        assert_eq!(sl_price(dec!(100), Side::Short, dec!(10)), dec!(110));
    }

    #[test]
    fn fixed_stop_fires_once() {
        let book = BracketBook::new();
        let pos = open_position(1, dec!(25600), Side::Long);
        let bracket = BracketSpec {
            sl: Some(SlSpec {
                value: dec!(10),
                unit: OffsetUnit::Points,
                sl_type: SlType::Fixed,
            }),
            ..Default::default()
        };
        // Fixed SL attaches locally only without native brackets.
        book.attach_from_spec(&pos, &bracket, false);
        assert_eq!(book.watched_count(), 1);

        assert!(book.evaluate("pos-1", dec!(25595)).is_empty(), "above stop");
        let fired = book.evaluate("pos-1", dec!(25590));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, ChildKind::StopLoss);

        // Fired is a terminal pre-ack state: it cannot fire again.
        assert!(book.evaluate("pos-1", dec!(25580)).is_empty());
    }

    #[test]
    fn native_brackets_skip_plain_tp_sl_but_keep_ladder() {
        let book = BracketBook::new();
        let pos = open_position(4, dec!(25600), Side::Long);
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
            targets: vec![TpTarget {
                value: dec!(10),
                unit: OffsetUnit::Points,
                trim_pct: 50,
            }],
        };
        book.attach_from_spec(&pos, &bracket, true);
        // Only the ladder target is local; the broker handles TP and SL.
        assert_eq!(book.watched_count(), 1);
    }

    #[test]
    fn trailing_stop_ratchets_with_best_price() {
        let book = BracketBook::new();
        let pos = open_position(1, dec!(25600), Side::Long);
        let bracket = BracketSpec {
            sl: Some(SlSpec {
                value: dec!(10),
                unit: OffsetUnit::Points,
                sl_type: SlType::Trailing,
            }),
            ..Default::default()
        };
        book.attach_from_spec(&pos, &bracket, true);

        // Price runs up 30 points: the trigger follows to 25620.
        assert!(book.evaluate("pos-1", dec!(25630)).is_empty());
        // A pullback that would have been fine against the original stop
        // (25590) now fires against the ratcheted trigger.
        let fired = book.evaluate("pos-1", dec!(25619));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn break_even_stop_arms_after_one_distance() {
        let book = BracketBook::new();
        let pos = open_position(1, dec!(25600), Side::Long);
        let bracket = BracketSpec {
            sl: Some(SlSpec {
                value: dec!(10),
                unit: OffsetUnit::Points,
                sl_type: SlType::BreakEven,
            }),
            ..Default::default()
        };
        book.attach_from_spec(&pos, &bracket, true);

        // Below the arming move, the stop sits at entry - 10.
        assert!(book.evaluate("pos-1", dec!(25595)).is_empty());
        // +10 favourable: armed, stop moves to entry.
        assert!(book.evaluate("pos-1", dec!(25610)).is_empty());
        // Falling back to entry now fires.
        let fired = book.evaluate("pos-1", dec!(25600));
        assert_eq!(fired.len(), 1);
    }

    async fn watcher_fixture(
        bracket: &BracketSpec,
    ) -> (Arc<PositionWatcher>, Store, Arc<LastPriceCache>, Arc<BracketBook>, i64) {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("ops", "x").await.unwrap();
        let recorder = store
            .insert_recorder(user, "r", "MNQ1!", 4, 1, false, &FilterConfig::default(), bracket, None)
            .await
            .unwrap();
        let account = store
            .insert_account(user, "apex", crate::types::Environment::Demo, "cid", "secret")
            .await
            .unwrap();
        let sub = store.insert_subaccount(account, 77001, "SIM-1").await.unwrap();
        store.insert_trader(recorder.id, sub, dec!(1), None, None).await.unwrap();

        let bus = EventBus::new();
        let tracker = Arc::new(PositionTracker::new(store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            ExecutionQueue::new(64),
            Arc::new(SymbolResolver::new(None)),
            bus.clone(),
        ));
        let oracle = Arc::new(LastPriceCache::new());
        let book = Arc::new(BracketBook::new());
        let watcher = Arc::new(PositionWatcher::new(
            store.clone(),
            oracle.clone(),
            book.clone(),
            tracker.clone(),
            dispatcher,
            bus,
        ));

        // Open a LONG 4 @ 25600 through the tracker.
        tracker
            .apply_signal(
                recorder.id,
                "MNQ1!",
                Action::Buy,
                dec!(25600),
                Sizing {
                    initial_size: 4,
                    add_size: 1,
                    reverse_on_opposite: false,
                },
                dec!(2),
                "{}",
                "k1",
            )
            .await
            .unwrap();

        (watcher, store, oracle, book, recorder.id)
    }

    #[tokio::test]
    async fn tick_updates_marks_and_extremes() {
        let (watcher, store, oracle, _book, rec) = watcher_fixture(&BracketSpec::default()).await;

        oracle.record("MNQ1!", dec!(25590));
        watcher.tick().await.unwrap();
        let pos = store.get_open_position(rec, "MNQ1!").await.unwrap().unwrap();
        // (25590 - 25600) * 4 * $2 = -80.
        assert_eq!(pos.unrealized_pnl, dec!(-80));
        assert_eq!(pos.worst_unrealized_pnl, dec!(-80));
        assert_eq!(pos.current_price, Some(dec!(25590)));

        oracle.record("MNQ1!", dec!(25615));
        watcher.tick().await.unwrap();
        let pos = store.get_open_position(rec, "MNQ1!").await.unwrap().unwrap();
        assert_eq!(pos.unrealized_pnl, dec!(120));
        assert_eq!(pos.best_unrealized_pnl, dec!(120));
        // The worst extreme survives the recovery.
        assert_eq!(pos.worst_unrealized_pnl, dec!(-80));
    }

    #[tokio::test]
    async fn ladder_target_trims_and_dispatches() {
        let bracket = BracketSpec {
            targets: vec![TpTarget {
                value: dec!(10),
                unit: OffsetUnit::Points,
                trim_pct: 50,
            }],
            ..Default::default()
        };
        let (watcher, store, oracle, book, rec) = watcher_fixture(&bracket).await;

        // Re-attach children the way the webhook pipeline does on open.
        let pos = store.get_open_position(rec, "MNQ1!").await.unwrap().unwrap();
        book.attach_from_spec(&pos, &bracket, true);

        oracle.record("MNQ1!", dec!(25610));
        watcher.tick().await.unwrap();

        let pos = store.get_open_position(rec, "MNQ1!").await.unwrap().unwrap();
        assert_eq!(pos.total_quantity, 2, "50% of 4 trimmed");
        // Trim pnl: 2 * 10 points * $2 = 40 accrued on the open row.
        assert_eq!(pos.realized_pnl, dec!(40));

        // The closing order went onto the queue.
        let (task, _lease) = watcher.dispatcher.queue().pop().await.unwrap();
        assert!(task.closing);
        assert_eq!(task.quantity, 2);
        assert_eq!(task.action, Action::Sell);
    }

    #[tokio::test]
    async fn local_stop_closes_position_and_dispatches() {
        let bracket = BracketSpec {
            sl: Some(SlSpec {
                value: dec!(10),
                unit: OffsetUnit::Points,
                sl_type: SlType::Trailing,
            }),
            ..Default::default()
        };
        let (watcher, store, oracle, book, rec) = watcher_fixture(&bracket).await;
        let pos = store.get_open_position(rec, "MNQ1!").await.unwrap().unwrap();
        book.attach_from_spec(&pos, &bracket, true);

        oracle.record("MNQ1!", dec!(25585));
        watcher.tick().await.unwrap();

        assert!(
            store.get_open_position(rec, "MNQ1!").await.unwrap().is_none(),
            "stop must close the engine position"
        );
        let closed = store.list_closed_positions(rec, 1).await.unwrap();
        // (25585 - 25600) * 4 * $2 = -120.
        assert_eq!(closed[0].realized_pnl, dec!(-120));
        assert_eq!(book.watched_count(), 0, "children removed with the position");

        let (task, _lease) = watcher.dispatcher.queue().pop().await.unwrap();
        assert!(task.closing);
        assert_eq!(task.quantity, 4);
    }
}
