// =============================================================================
// Position Engine — signal-derived position state machine
// =============================================================================
//
// Position is a pure function of the accepted signal log for a recorder.
// The broker is never consulted to decide what the engine's position is;
// that keeps broker-side read failures from ever losing or inventing a
// position.
//
// Transition table per (recorder, ticker):
//   FLAT  + BUY   -> LONG(initial_size)            Open
//   FLAT  + SELL  -> SHORT(initial_size)           Open
//   FLAT  + CLOSE -> FLAT                          NoOp
//   LONG  + BUY   -> LONG(q + add_size, wavg)      Add
//   LONG  + SELL  -> FLAT [+ SHORT if reversing]   Close [+ Open]
//   LONG  + CLOSE -> FLAT                          Close
//   SHORT mirrors LONG.
//
// All price and P&L arithmetic is exact Decimal; the weighted average is
// (a·q + p·dq) / (q + dq).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{PositionChange, PositionRow, PositionStatus, SignalRow, Store};
use crate::types::{Action, Side};

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

/// Signal-price-weighted mean entry: `(a·q + p·dq) / (q + dq)`.
pub fn weighted_avg(avg: Decimal, qty: i64, price: Decimal, add_qty: i64) -> Decimal {
    let q = Decimal::from(qty);
    let dq = Decimal::from(add_qty);
    (avg * q + price * dq) / (q + dq)
}

/// `(exit − avg) · qty · point_value · side_sign`.
pub fn realized_pnl(
    avg_entry: Decimal,
    exit_price: Decimal,
    qty: i64,
    point_value: Decimal,
    side: Side,
) -> Decimal {
    (exit_price - avg_entry) * Decimal::from(qty) * point_value * side.sign()
}

/// Same formula with the current mark in place of the exit.
pub fn unrealized_pnl(
    avg_entry: Decimal,
    current_price: Decimal,
    qty: i64,
    point_value: Decimal,
    side: Side,
) -> Decimal {
    realized_pnl(avg_entry, current_price, qty, point_value, side)
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Side-effect descriptor emitted by a transition. The dispatcher turns
/// each effect into one ExecutionTask per enabled trader; the event bus
/// broadcasts them to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionEffect {
    Open {
        position_id: String,
        side: Side,
        quantity: i64,
        price: Decimal,
    },
    Add {
        position_id: String,
        side: Side,
        quantity: i64,
        price: Decimal,
        new_total: i64,
        new_avg: Decimal,
    },
    Close {
        position_id: String,
        side: Side,
        quantity: i64,
        exit_price: Decimal,
        realized_pnl: Decimal,
    },
    /// A fired TP target reduced the open quantity. Produced by the bracket
    /// watcher, never by a signal transition.
    Trim {
        position_id: String,
        side: Side,
        quantity: i64,
        price: Decimal,
        remaining: i64,
    },
    NoOp,
}

impl PositionEffect {
    /// The quantity the dispatcher scales per trader: initial_size on open,
    /// add_size on add, the full (or trimmed) quantity on close/trim.
    pub fn base_quantity(&self) -> i64 {
        match self {
            Self::Open { quantity, .. }
            | Self::Add { quantity, .. }
            | Self::Close { quantity, .. }
            | Self::Trim { quantity, .. } => *quantity,
            Self::NoOp => 0,
        }
    }
}

/// Sizing inputs for a transition, taken from the recorder row.
#[derive(Debug, Clone, Copy)]
pub struct Sizing {
    pub initial_size: i64,
    pub add_size: i64,
    pub reverse_on_opposite: bool,
}

// ---------------------------------------------------------------------------
// Pure transition
// ---------------------------------------------------------------------------

fn new_open_row(
    recorder_id: i64,
    ticker: &str,
    side: Side,
    quantity: i64,
    price: Decimal,
    point_value: Decimal,
    opened_at: &str,
) -> PositionRow {
    PositionRow {
        id: Uuid::new_v4().to_string(),
        recorder_id,
        ticker: ticker.to_string(),
        side,
        total_quantity: quantity,
        avg_entry_price: price,
        current_price: Some(price),
        unrealized_pnl: Decimal::ZERO,
        worst_unrealized_pnl: Decimal::ZERO,
        best_unrealized_pnl: Decimal::ZERO,
        point_value,
        status: PositionStatus::Open,
        opened_at: opened_at.to_string(),
        closed_at: None,
        exit_price: None,
        realized_pnl: Decimal::ZERO,
    }
}

/// Apply one signal to the current (possibly absent) open position.
///
/// Returns the store mutation plus the ordered effects. On a FLIP the close
/// effect strictly precedes the reverse open, and the dispatcher preserves
/// that order per (trader, symbol).
pub fn transition(
    recorder_id: i64,
    ticker: &str,
    current: Option<&PositionRow>,
    action: Action,
    price: Decimal,
    sizing: Sizing,
    point_value: Decimal,
    now: &str,
) -> (PositionChange, Vec<PositionEffect>) {
    match (current, action) {
        // ── FLAT ────────────────────────────────────────────────────────
        (None, Action::Buy) | (None, Action::Sell) => {
            let side = if action == Action::Buy {
                Side::Long
            } else {
                Side::Short
            };
            let row = new_open_row(
                recorder_id,
                ticker,
                side,
                sizing.initial_size,
                price,
                point_value,
                now,
            );
            let effect = PositionEffect::Open {
                position_id: row.id.clone(),
                side,
                quantity: sizing.initial_size,
                price,
            };
            (PositionChange::Open(row), vec![effect])
        }
        (None, Action::Close) => (PositionChange::None, vec![PositionEffect::NoOp]),

        // ── Same-direction add ──────────────────────────────────────────
        (Some(pos), a) if a == pos.side.entry_action() => {
            let new_total = pos.total_quantity + sizing.add_size;
            let new_avg = weighted_avg(
                pos.avg_entry_price,
                pos.total_quantity,
                price,
                sizing.add_size,
            );
            let effect = PositionEffect::Add {
                position_id: pos.id.clone(),
                side: pos.side,
                quantity: sizing.add_size,
                price,
                new_total,
                new_avg,
            };
            (
                PositionChange::Add {
                    id: pos.id.clone(),
                    total_quantity: new_total,
                    avg_entry_price: new_avg,
                },
                vec![effect],
            )
        }

        // ── Opposite direction: close, optionally flip ──────────────────
        (Some(pos), a) if a == pos.side.exit_action() => {
            let pnl = realized_pnl(
                pos.avg_entry_price,
                price,
                pos.total_quantity,
                pos.point_value,
                pos.side,
            );
            let close_effect = PositionEffect::Close {
                position_id: pos.id.clone(),
                side: pos.side,
                quantity: pos.total_quantity,
                exit_price: price,
                realized_pnl: pnl,
            };

            if sizing.reverse_on_opposite {
                let new_side = pos.side.opposite();
                let row = new_open_row(
                    recorder_id,
                    ticker,
                    new_side,
                    sizing.initial_size,
                    price,
                    point_value,
                    now,
                );
                let open_effect = PositionEffect::Open {
                    position_id: row.id.clone(),
                    side: new_side,
                    quantity: sizing.initial_size,
                    price,
                };
                (
                    PositionChange::CloseAndOpen {
                        close_id: pos.id.clone(),
                        exit_price: price,
                        realized_pnl: pnl,
                        closed_at: now.to_string(),
                        open: row,
                    },
                    vec![close_effect, open_effect],
                )
            } else {
                (
                    PositionChange::Close {
                        id: pos.id.clone(),
                        exit_price: price,
                        realized_pnl: pnl,
                        closed_at: now.to_string(),
                    },
                    vec![close_effect],
                )
            }
        }

        // ── Explicit close ──────────────────────────────────────────────
        (Some(pos), Action::Close) => {
            let pnl = realized_pnl(
                pos.avg_entry_price,
                price,
                pos.total_quantity,
                pos.point_value,
                pos.side,
            );
            let effect = PositionEffect::Close {
                position_id: pos.id.clone(),
                side: pos.side,
                quantity: pos.total_quantity,
                exit_price: price,
                realized_pnl: pnl,
            };
            (
                PositionChange::Close {
                    id: pos.id.clone(),
                    exit_price: price,
                    realized_pnl: pnl,
                    closed_at: now.to_string(),
                },
                vec![effect],
            )
        }

        // Exhaustiveness: the guards above cover every (Some, action) pair.
        (Some(_), _) => (PositionChange::None, vec![PositionEffect::NoOp]),
    }
}

// ---------------------------------------------------------------------------
// Tracker — serialises transitions per (recorder, ticker) and commits them
// ---------------------------------------------------------------------------

/// Outcome of applying one accepted signal.
#[derive(Debug, Clone)]
pub struct AppliedSignal {
    pub signal: SignalRow,
    pub effects: Vec<PositionEffect>,
}

/// Bridges the pure transition to the store. Concurrent signals to the same
/// (recorder, ticker) serialise on a per-key async lock; different keys
/// proceed in parallel.
pub struct PositionTracker {
    store: Store,
    key_locks: parking_lot::Mutex<HashMap<(i64, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl PositionTracker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            key_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, recorder_id: i64, ticker: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks
            .entry((recorder_id, ticker.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Apply an accepted signal: read the open row, run the transition, and
    /// commit the log append plus the position mutation in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_signal(
        &self,
        recorder_id: i64,
        ticker: &str,
        action: Action,
        price: Decimal,
        sizing: Sizing,
        point_value: Decimal,
        raw_payload: &str,
        dedup_key: &str,
    ) -> Result<AppliedSignal> {
        let lock = self.key_lock(recorder_id, ticker);
        let _guard = lock.lock().await;

        let now = Utc::now().to_rfc3339();
        let current = self.store.get_open_position(recorder_id, ticker).await?;

        let (change, effects) = transition(
            recorder_id,
            ticker,
            current.as_ref(),
            action,
            price,
            sizing,
            point_value,
            &now,
        );

        let signal = SignalRow {
            id: Uuid::new_v4().to_string(),
            recorder_id,
            seq: self.store.next_signal_seq(),
            received_at: now,
            action: action.to_string(),
            ticker: ticker.to_string(),
            price,
            raw_payload: raw_payload.to_string(),
            dedup_key: dedup_key.to_string(),
        };

        self.store.commit_signal(&signal, &change).await?;

        for effect in &effects {
            match effect {
                PositionEffect::Open {
                    position_id,
                    side,
                    quantity,
                    price,
                } => info!(
                    recorder_id,
                    ticker,
                    position_id = %position_id,
                    side = %side,
                    quantity,
                    price = %price,
                    "position opened"
                ),
                PositionEffect::Add {
                    position_id,
                    new_total,
                    new_avg,
                    ..
                } => info!(
                    recorder_id,
                    ticker,
                    position_id = %position_id,
                    new_total,
                    new_avg = %new_avg,
                    "position added"
                ),
                PositionEffect::Close {
                    position_id,
                    realized_pnl,
                    exit_price,
                    ..
                } => info!(
                    recorder_id,
                    ticker,
                    position_id = %position_id,
                    exit_price = %exit_price,
                    realized_pnl = %realized_pnl,
                    "position closed"
                ),
                PositionEffect::Trim { .. } => {}
                PositionEffect::NoOp => {
                    warn!(recorder_id, ticker, action = %action, "close on flat position — no-op");
                }
            }
        }

        Ok(AppliedSignal { signal, effects })
    }

    /// Close an open position because a watched stop or final take-profit
    /// fired. Skips silently if the position already closed under us.
    pub async fn apply_watcher_close(
        &self,
        position: &PositionRow,
        price: Decimal,
    ) -> Result<Option<PositionEffect>> {
        let lock = self.key_lock(position.recorder_id, &position.ticker);
        let _guard = lock.lock().await;

        let Some(open) = self
            .store
            .get_open_position(position.recorder_id, &position.ticker)
            .await?
        else {
            return Ok(None);
        };
        if open.id != position.id {
            return Ok(None);
        }

        let pnl = open.realized_pnl
            + realized_pnl(
                open.avg_entry_price,
                price,
                open.total_quantity,
                open.point_value,
                open.side,
            );
        let closed_at = Utc::now().to_rfc3339();
        self.store
            .close_position_direct(&open.id, price, pnl, &closed_at)
            .await?;

        info!(
            position_id = %open.id,
            exit_price = %price,
            realized_pnl = %pnl,
            "position closed by bracket watcher"
        );

        Ok(Some(PositionEffect::Close {
            position_id: open.id,
            side: open.side,
            quantity: open.total_quantity,
            exit_price: price,
            realized_pnl: pnl,
        }))
    }

    /// Trim an open position after a TP target fires: reduce the quantity
    /// and accumulate the trim's realized P&L on the open row.
    pub async fn apply_trim(
        &self,
        position: &PositionRow,
        trim_qty: i64,
        price: Decimal,
    ) -> Result<Option<PositionEffect>> {
        let lock = self.key_lock(position.recorder_id, &position.ticker);
        let _guard = lock.lock().await;

        let Some(open) = self
            .store
            .get_open_position(position.recorder_id, &position.ticker)
            .await?
        else {
            return Ok(None);
        };
        if open.id != position.id || trim_qty <= 0 {
            return Ok(None);
        }

        // A trim that would take quantity to zero or below is a close,
        // which only the state machine may perform.
        let trim_qty = trim_qty.min(open.total_quantity - 1);
        if trim_qty <= 0 {
            return Ok(None);
        }

        let pnl = realized_pnl(
            open.avg_entry_price,
            price,
            trim_qty,
            open.point_value,
            open.side,
        );
        let remaining = open.total_quantity - trim_qty;
        self.store
            .trim_position(&open.id, remaining, open.realized_pnl + pnl)
            .await?;

        info!(
            position_id = %open.id,
            trim_qty,
            remaining,
            price = %price,
            trim_pnl = %pnl,
            "position trimmed by TP target"
        );

        Ok(Some(PositionEffect::Trim {
            position_id: open.id,
            side: open.side,
            quantity: trim_qty,
            price,
            remaining,
        }))
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SIZING: Sizing = Sizing {
        initial_size: 1,
        add_size: 1,
        reverse_on_opposite: false,
    };

    fn open_pos(side: Side, qty: i64, avg: Decimal, point_value: Decimal) -> PositionRow {
        PositionRow {
            id: "pos-1".to_string(),
            recorder_id: 1,
            ticker: "MNQ1!".to_string(),
            side,
            total_quantity: qty,
            avg_entry_price: avg,
            current_price: Some(avg),
            unrealized_pnl: Decimal::ZERO,
            worst_unrealized_pnl: Decimal::ZERO,
            best_unrealized_pnl: Decimal::ZERO,
            point_value,
            status: PositionStatus::Open,
            opened_at: "2026-03-04T14:30:00+00:00".to_string(),
            closed_at: None,
            exit_price: None,
            realized_pnl: Decimal::ZERO,
        }
    }

    #[test]
    fn weighted_avg_matches_definition() {
        // 1 @ 25600 then +1 @ 25610 -> 25605.
        assert_eq!(weighted_avg(dec!(25600), 1, dec!(25610), 1), dec!(25605));
        // Uneven sizes: 2 @ 100 then +1 @ 130 -> 110.
        assert_eq!(weighted_avg(dec!(100), 2, dec!(130), 1), dec!(110));
    }

    #[test]
    fn weighted_avg_over_any_sequence_is_total_weighted_mean() {
        // The running average after s_1..s_n equals (Σ p_i·q_i)/(Σ q_i), exactly.
        let fills: [(Decimal, i64); 4] =
            [(dec!(25600.25), 1), (dec!(25610.50), 2), (dec!(25590), 3), (dec!(25605.75), 2)];
        let (mut avg, mut qty) = (fills[0].0, fills[0].1);
        for &(p, q) in &fills[1..] {
            avg = weighted_avg(avg, qty, p, q);
            qty += q;
        }
        let num: Decimal = fills.iter().map(|&(p, q)| p * Decimal::from(q)).sum();
        let den: Decimal = fills.iter().map(|&(_, q)| Decimal::from(q)).sum();
        assert_eq!(avg, num / den);
    }

    #[test]
    fn flat_buy_opens_long_at_initial_size() {
        let (change, effects) = transition(
            1,
            "MNQ1!",
            None,
            Action::Buy,
            dec!(25600),
            SIZING,
            dec!(2),
            "2026-03-04T14:30:00+00:00",
        );
        match change {
            PositionChange::Open(row) => {
                assert_eq!(row.side, Side::Long);
                assert_eq!(row.total_quantity, 1);
                assert_eq!(row.avg_entry_price, dec!(25600));
                assert_eq!(row.point_value, dec!(2));
            }
            other => panic!("expected Open, got {other:?}"),
        }
        assert!(matches!(effects[0], PositionEffect::Open { .. }));
    }

    #[test]
    fn flat_close_is_noop() {
        let (change, effects) = transition(
            1,
            "MNQ1!",
            None,
            Action::Close,
            dec!(25600),
            SIZING,
            dec!(2),
            "2026-03-04T14:30:00+00:00",
        );
        assert!(matches!(change, PositionChange::None));
        assert!(matches!(effects[0], PositionEffect::NoOp));
    }

    #[test]
    fn long_buy_adds_with_weighted_average() {
        let pos = open_pos(Side::Long, 1, dec!(25600), dec!(2));
        let (change, effects) = transition(
            1,
            "MNQ1!",
            Some(&pos),
            Action::Buy,
            dec!(25610),
            SIZING,
            dec!(2),
            "2026-03-04T14:31:00+00:00",
        );
        match change {
            PositionChange::Add {
                total_quantity,
                avg_entry_price,
                ..
            } => {
                assert_eq!(total_quantity, 2);
                assert_eq!(avg_entry_price, dec!(25605));
            }
            other => panic!("expected Add, got {other:?}"),
        }
        match &effects[0] {
            PositionEffect::Add { quantity, .. } => assert_eq!(*quantity, 1),
            other => panic!("expected Add effect, got {other:?}"),
        }
    }

    #[test]
    fn close_realizes_point_value_pnl() {
        // LONG 1 @ 25600 on MNQ ($2/point), close @ 25620 -> +40.
        let pos = open_pos(Side::Long, 1, dec!(25600), dec!(2));
        let (change, _) = transition(
            1,
            "MNQ1!",
            Some(&pos),
            Action::Close,
            dec!(25620),
            SIZING,
            dec!(2),
            "2026-03-04T14:32:00+00:00",
        );
        match change {
            PositionChange::Close {
                exit_price,
                realized_pnl,
                ..
            } => {
                assert_eq!(exit_price, dec!(25620));
                assert_eq!(realized_pnl, dec!(40));
            }
            other => panic!("expected Close, got {other:?}"),
        }
    }

    #[test]
    fn short_close_pnl_sign_is_inverted() {
        let pos = open_pos(Side::Short, 2, dec!(25620), dec!(2));
        let (change, _) = transition(
            1,
            "MNQ1!",
            Some(&pos),
            Action::Close,
            dec!(25600),
            SIZING,
            dec!(2),
            "2026-03-04T14:33:00+00:00",
        );
        match change {
            PositionChange::Close { realized_pnl, .. } => {
                // (25600 - 25620) * 2 * 2 * (-1) = +80
                assert_eq!(realized_pnl, dec!(80));
            }
            other => panic!("expected Close, got {other:?}"),
        }
    }

    #[test]
    fn opposite_without_reverse_just_closes() {
        let pos = open_pos(Side::Long, 2, dec!(25605), dec!(2));
        let (change, effects) = transition(
            1,
            "MNQ1!",
            Some(&pos),
            Action::Sell,
            dec!(25620),
            SIZING,
            dec!(2),
            "2026-03-04T14:34:00+00:00",
        );
        assert!(matches!(change, PositionChange::Close { .. }));
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn flip_emits_close_then_open_in_order() {
        // LONG 2 @ 25605, SELL @ 25620 with reverse enabled.
        let sizing = Sizing {
            reverse_on_opposite: true,
            ..SIZING
        };
        let pos = open_pos(Side::Long, 2, dec!(25605), dec!(2));
        let (change, effects) = transition(
            1,
            "MNQ1!",
            Some(&pos),
            Action::Sell,
            dec!(25620),
            sizing,
            dec!(2),
            "2026-03-04T14:35:00+00:00",
        );
        match &change {
            PositionChange::CloseAndOpen {
                realized_pnl, open, ..
            } => {
                // (25620 - 25605) * 2 * 2 = 60
                assert_eq!(*realized_pnl, dec!(60));
                assert_eq!(open.side, Side::Short);
                assert_eq!(open.total_quantity, 1);
                assert_eq!(open.avg_entry_price, dec!(25620));
            }
            other => panic!("expected CloseAndOpen, got {other:?}"),
        }
        assert_eq!(effects.len(), 2);
        assert!(matches!(effects[0], PositionEffect::Close { .. }));
        assert!(
            matches!(effects[1], PositionEffect::Open { side: Side::Short, .. }),
            "close must strictly precede the reverse open"
        );
    }

    #[test]
    fn short_add_mirrors_long() {
        let pos = open_pos(Side::Short, 1, dec!(100), dec!(5));
        let (change, _) = transition(
            1,
            "MES1!",
            Some(&pos),
            Action::Sell,
            dec!(90),
            SIZING,
            dec!(5),
            "2026-03-04T14:36:00+00:00",
        );
        match change {
            PositionChange::Add {
                total_quantity,
                avg_entry_price,
                ..
            } => {
                assert_eq!(total_quantity, 2);
                assert_eq!(avg_entry_price, dec!(95));
            }
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tracker_persists_open_then_close() {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("ops", "x").await.unwrap();
        let rec = store
            .insert_recorder(
                user,
                "r",
                "MNQ1!",
                1,
                1,
                false,
                &crate::filters::FilterConfig::default(),
                &crate::types::BracketSpec::default(),
                None,
            )
            .await
            .unwrap();
        let tracker = PositionTracker::new(store.clone());

        let applied = tracker
            .apply_signal(rec.id, "MNQ1!", Action::Buy, dec!(25600), SIZING, dec!(2), "{}", "k1")
            .await
            .unwrap();
        assert!(matches!(applied.effects[0], PositionEffect::Open { .. }));

        let open = store.get_open_position(rec.id, "MNQ1!").await.unwrap().unwrap();
        assert_eq!(open.avg_entry_price, dec!(25600));

        let applied = tracker
            .apply_signal(rec.id, "MNQ1!", Action::Close, dec!(25620), SIZING, dec!(2), "{}", "k2")
            .await
            .unwrap();
        match &applied.effects[0] {
            PositionEffect::Close { realized_pnl, .. } => assert_eq!(*realized_pnl, dec!(40)),
            other => panic!("expected Close effect, got {other:?}"),
        }
        assert!(store.get_open_position(rec.id, "MNQ1!").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tracker_trim_reduces_but_never_zeroes() {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("ops", "x").await.unwrap();
        let rec = store
            .insert_recorder(
                user,
                "r",
                "MNQ1!",
                3,
                1,
                false,
                &crate::filters::FilterConfig::default(),
                &crate::types::BracketSpec::default(),
                None,
            )
            .await
            .unwrap();
        let tracker = PositionTracker::new(store.clone());
        let sizing = Sizing {
            initial_size: 3,
            add_size: 1,
            reverse_on_opposite: false,
        };

        tracker
            .apply_signal(rec.id, "MNQ1!", Action::Buy, dec!(25600), sizing, dec!(2), "{}", "k1")
            .await
            .unwrap();
        let open = store.get_open_position(rec.id, "MNQ1!").await.unwrap().unwrap();

        let effect = tracker
            .apply_trim(&open, 2, dec!(25610))
            .await
            .unwrap()
            .unwrap();
        match effect {
            PositionEffect::Trim { quantity, remaining, .. } => {
                assert_eq!(quantity, 2);
                assert_eq!(remaining, 1);
            }
            other => panic!("expected Trim, got {other:?}"),
        }

        let after = store.get_open_position(rec.id, "MNQ1!").await.unwrap().unwrap();
        assert_eq!(after.total_quantity, 1);
        // Trim of 2 @ +10 points on $2 multiplier: +40 accrued on the row.
        assert_eq!(after.realized_pnl, dec!(40));

        // A trim that would flatten the position is refused.
        assert!(tracker.apply_trim(&after, 5, dec!(25610)).await.unwrap().is_none());
    }
}
