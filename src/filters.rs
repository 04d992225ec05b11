// =============================================================================
// Filter Pipeline — ordered, short-circuiting signal admission checks
// =============================================================================
//
// Filters run in a fixed order and stop at the first rejection:
//   1. recorder enabled
//   2. blocked directions
//   3. time windows (recorder-local, UTC-offset based)
//   4. signal cooldown
//   5. max signals per session
//   6. max daily loss
//   7. nth-signal delay
//   8. max contracts per trade (transformation, not rejection)
//
// Every evaluation produces a structured FilterDecision which is logged to
// the event bus verbatim, accepted or not.
// =============================================================================

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Action;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One admission window in the recorder's local day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Minutes after local midnight the window opens (inclusive).
    pub start_minute: u32,
    /// Minutes after local midnight the window closes (exclusive).
    pub end_minute: u32,
    /// Local offset from UTC in minutes (e.g. -300 for US/Eastern winter).
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// Per-recorder filter configuration, stored as JSON on the recorder row.
/// Traders may carry an override with the same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Signal actions this recorder refuses outright.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_directions: Vec<Action>,

    /// Admission windows. Empty means always open.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_windows: Vec<TimeWindow>,

    /// Minimum seconds between accepted signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,

    /// Cap on accepted signals for the current session (trading day).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_signals_per_session: Option<u32>,

    /// Reject once today's realized loss reaches this figure (positive
    /// number of currency units).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_daily_loss: Option<Decimal>,

    /// Admit only every Nth raw signal (counter advances for every signal
    /// that passed the preceding filters).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nth_signal: Option<u32>,

    /// Cap on the per-trader dispatched quantity. A transformation, never
    /// a rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_contracts_per_trade: Option<i64>,
}

impl FilterConfig {
    /// The UTC offset the recorder's session day rolls over in: the first
    /// configured window's offset, or UTC when no windows are set.
    pub fn session_offset_minutes(&self) -> i32 {
        self.time_windows
            .first()
            .map(|w| w.utc_offset_minutes)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Evaluation inputs and output
// ---------------------------------------------------------------------------

/// Counters the pipeline needs that live outside the recorder row. The
/// caller assembles these from the session risk state and the store.
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
    /// When this recorder last accepted a signal (None if never today).
    pub last_accepted_at: Option<DateTime<Utc>>,
    /// Signals accepted so far in the current session.
    pub accepted_in_session: u32,
    /// Raw signals seen so far today that passed filters 1-6 (drives the
    /// nth-signal counter). The current signal is number `raw_seen + 1`.
    pub raw_seen: u32,
    /// Realized P&L across this recorder's positions closed today.
    pub realized_today: Decimal,
}

/// Structured outcome of one pipeline run. Logged verbatim regardless of
/// outcome.
#[derive(Debug, Clone, Serialize)]
pub struct FilterDecision {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformed_quantity: Option<i64>,
    /// True when the nth-signal counter advanced (filters 1-6 passed).
    #[serde(skip)]
    pub counted_raw: bool,
}

impl FilterDecision {
    fn reject(reason: impl Into<String>, counted_raw: bool) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            transformed_quantity: None,
            counted_raw,
        }
    }

    fn accept(transformed_quantity: Option<i64>) -> Self {
        Self {
            accepted: true,
            reason: None,
            transformed_quantity,
            counted_raw: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Evaluate the pipeline for one signal.
///
/// `enabled` is the recorder's enabled flag; `quantity` is the base
/// quantity the dispatcher would use (pre fan-out scaling) and is only
/// consulted by the max-contracts transformation.
pub fn evaluate(
    enabled: bool,
    config: &FilterConfig,
    action: Action,
    received_at: DateTime<Utc>,
    quantity: i64,
    ctx: &FilterContext,
) -> FilterDecision {
    // ── 1. Recorder enabled ─────────────────────────────────────────────
    if !enabled {
        return FilterDecision::reject("disabled", false);
    }

    // ── 2. Direction filter ─────────────────────────────────────────────
    if config.blocked_directions.contains(&action) {
        return FilterDecision::reject("direction", false);
    }

    // ── 3. Time windows ─────────────────────────────────────────────────
    if !config.time_windows.is_empty() {
        let in_any = config.time_windows.iter().any(|w| {
            let offset = FixedOffset::east_opt(w.utc_offset_minutes * 60)
                .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
            let local = received_at.with_timezone(&offset);
            let minute = local.hour() * 60 + local.minute();
            minute >= w.start_minute && minute < w.end_minute
        });
        if !in_any {
            return FilterDecision::reject("time_window", false);
        }
    }

    // ── 4. Cooldown ─────────────────────────────────────────────────────
    if let (Some(cooldown), Some(last)) = (config.cooldown_seconds, ctx.last_accepted_at) {
        let elapsed = received_at.signed_duration_since(last).num_seconds();
        if elapsed >= 0 && (elapsed as u64) < cooldown {
            return FilterDecision::reject("cooldown", false);
        }
    }

    // ── 5. Max signals per session ──────────────────────────────────────
    if let Some(max) = config.max_signals_per_session {
        if ctx.accepted_in_session >= max {
            return FilterDecision::reject("max_signals", false);
        }
    }

    // ── 6. Max daily loss ───────────────────────────────────────────────
    if let Some(max_loss) = config.max_daily_loss {
        if ctx.realized_today <= -max_loss {
            return FilterDecision::reject("max_daily_loss", false);
        }
    }

    // ── 7. Nth-signal delay ─────────────────────────────────────────────
    // This signal is number raw_seen + 1 among those that reached here.
    if let Some(n) = config.nth_signal {
        if n > 1 && (ctx.raw_seen + 1) % n != 0 {
            return FilterDecision::reject("nth_signal", true);
        }
    }

    // ── 8. Max contracts per trade (transformation) ─────────────────────
    let transformed = config.max_contracts_per_trade.and_then(|cap| {
        if quantity > cap {
            debug!(quantity, cap, "quantity capped by max_contracts_per_trade");
            Some(cap)
        } else {
            None
        }
    });

    FilterDecision::accept(transformed)
}
