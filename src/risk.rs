// =============================================================================
// Session Risk State — per-recorder counters feeding the filter pipeline
// =============================================================================
//
// Tracks, per recorder: accepted-signal count for the current session, the
// raw-signal counter driving the nth-signal filter, and the last accepted
// timestamp for the cooldown filter. Counters reset when the recorder's
// local trading date rolls over (the session offset comes from the
// recorder's first time window, UTC otherwise).
//
// Realized daily P&L is not tracked here; the webhook pipeline reads it
// from the store so restarts cannot forget losses.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
struct RecorderSession {
    /// Local trading date the counters belong to (YYYY-MM-DD).
    session_date: String,
    accepted_in_session: u32,
    raw_seen: u32,
    #[serde(skip)]
    last_accepted_at: Option<DateTime<Utc>>,
}

impl RecorderSession {
    fn fresh(date: String) -> Self {
        Self {
            session_date: date,
            accepted_in_session: 0,
            raw_seen: 0,
            last_accepted_at: None,
        }
    }
}

/// Counters the filter pipeline consumes for one evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    pub accepted_in_session: u32,
    pub raw_seen: u32,
    pub last_accepted_at: Option<DateTime<Utc>>,
}

/// Thread-safe per-recorder session state.
pub struct SessionRiskState {
    inner: RwLock<HashMap<i64, RecorderSession>>,
}

/// Local date string for `now` at the given UTC offset.
fn local_date(now: DateTime<Utc>, offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    now.with_timezone(&offset).format("%Y-%m-%d").to_string()
}

/// RFC 3339 UTC instant at which the current local trading day began.
pub fn session_day_start(now: DateTime<Utc>, offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    let local = now.with_timezone(&offset);
    let midnight = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_else(|| local.naive_local());
    match midnight.and_local_timezone(offset).single() {
        Some(start) => start.with_timezone(&Utc).to_rfc3339(),
        // Fixed offsets have no ambiguous local times; fall back to now.
        None => now.to_rfc3339(),
    }
}

impl SessionRiskState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Current counters for a recorder, rolling the session over first if
    /// the local date changed.
    pub fn counters(
        &self,
        recorder_id: i64,
        offset_minutes: i32,
        now: DateTime<Utc>,
    ) -> SessionCounters {
        let date = local_date(now, offset_minutes);
        let mut map = self.inner.write();
        let entry = map
            .entry(recorder_id)
            .or_insert_with(|| RecorderSession::fresh(date.clone()));
        if entry.session_date != date {
            debug!(
                recorder_id,
                old = %entry.session_date,
                new = %date,
                "session rollover — resetting counters"
            );
            *entry = RecorderSession::fresh(date);
        }
        SessionCounters {
            accepted_in_session: entry.accepted_in_session,
            raw_seen: entry.raw_seen,
            last_accepted_at: entry.last_accepted_at,
        }
    }

    /// Advance the raw-signal counter (filters 1-6 passed for this signal).
    pub fn note_raw(&self, recorder_id: i64) {
        if let Some(entry) = self.inner.write().get_mut(&recorder_id) {
            entry.raw_seen += 1;
        }
    }

    /// Record an accepted signal.
    pub fn note_accepted(&self, recorder_id: i64, at: DateTime<Utc>) {
        if let Some(entry) = self.inner.write().get_mut(&recorder_id) {
            entry.accepted_in_session += 1;
            entry.last_accepted_at = Some(at);
        }
    }

    /// Accepted-count snapshot for the execution-status endpoint.
    pub fn accepted_today(&self, recorder_id: i64) -> u32 {
        self.inner
            .read()
            .get(&recorder_id)
            .map(|e| e.accepted_in_session)
            .unwrap_or(0)
    }
}

impl Default for SessionRiskState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRiskState")
            .field("recorders", &self.inner.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn counters_start_empty_and_accumulate() {
        let state = SessionRiskState::new();
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 15, 0, 0).unwrap();

        let c = state.counters(1, 0, now);
        assert_eq!(c.accepted_in_session, 0);
        assert_eq!(c.raw_seen, 0);

        state.note_raw(1);
        state.note_accepted(1, now);

        let c = state.counters(1, 0, now);
        assert_eq!(c.accepted_in_session, 1);
        assert_eq!(c.raw_seen, 1);
        assert_eq!(c.last_accepted_at, Some(now));
    }

    #[test]
    fn date_rollover_resets_counters() {
        let state = SessionRiskState::new();
        let day1 = Utc.with_ymd_and_hms(2026, 3, 4, 23, 0, 0).unwrap();
        state.counters(1, 0, day1);
        state.note_raw(1);
        state.note_accepted(1, day1);

        let day2 = Utc.with_ymd_and_hms(2026, 3, 5, 0, 30, 0).unwrap();
        let c = state.counters(1, 0, day2);
        assert_eq!(c.accepted_in_session, 0);
        assert_eq!(c.raw_seen, 0);
        assert!(c.last_accepted_at.is_none());
    }

    #[test]
    fn offset_shifts_the_rollover_boundary() {
        let state = SessionRiskState::new();
        // 00:30 UTC on Mar 5 is still Mar 4 at UTC-5.
        let t = Utc.with_ymd_and_hms(2026, 3, 5, 0, 30, 0).unwrap();
        state.counters(1, -300, Utc.with_ymd_and_hms(2026, 3, 4, 23, 0, 0).unwrap());
        state.note_accepted(1, t);

        let c = state.counters(1, -300, t);
        assert_eq!(c.accepted_in_session, 1, "no rollover before local midnight");
    }

    #[test]
    fn session_day_start_respects_offset() {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 0, 30, 0).unwrap();
        // At UTC-5 the local day began at 05:00 UTC on Mar 4.
        let start = session_day_start(now, -300);
        assert!(start.starts_with("2026-03-04T05:00:00"));

        let start_utc = session_day_start(now, 0);
        assert!(start_utc.starts_with("2026-03-05T00:00:00"));
    }
}
