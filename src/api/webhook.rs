// =============================================================================
// Webhook Edge — POST /webhook/<token>
// =============================================================================
//
// The full ingress path for one signal:
//   token resolution (constant-time) -> HMAC verification -> rate limit ->
//   JSON parse -> dedup -> filter pipeline -> position state machine ->
//   fan-out dispatch.
//
// The response is produced synchronously: the handler waits only for the
// in-memory state machine and the signal+position transaction, never for
// broker I/O (that happens on the worker pool). An unknown or unverifiable
// token is answered 404 with no distinguishing body.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::auth::constant_time_eq;
use crate::app_state::{AppState, DecisionRecord};
use crate::broker::symbols::{point_value_or_default, ticker_root};
use crate::events::EngineEvent;
use crate::filters::{self, FilterContext};
use crate::position_engine::{PositionEffect, Sizing};
use crate::risk::session_day_start;
use crate::signal::SignalPayload;
use crate::store::WebhookTokenEntry;
use crate::types::TradingMode;

type HmacSha256 = Hmac<Sha256>;

/// Webhook tokens are 128-bit hex.
const TOKEN_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Reply model (separable from HTTP for tests)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookReply {
    /// Unknown token or failed signature — indistinguishable on the wire.
    NotFound,
    BadRequest(String),
    /// Replay inside the dedup window; idempotent success.
    Deduplicated,
    ShuttingDown,
    Decision {
        accepted: bool,
        reason: Option<String>,
        dispatched: u32,
    },
}

impl IntoResponse for WebhookReply {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND.into_response(),
            Self::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": detail })),
            )
                .into_response(),
            Self::Deduplicated => Json(serde_json::json!({ "deduplicated": true })).into_response(),
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE.into_response(),
            Self::Decision {
                accepted,
                reason,
                dispatched,
            } => {
                let mut body = serde_json::json!({
                    "accepted": accepted,
                    "dispatched": dispatched,
                });
                if let Some(reason) = reason {
                    body["reason"] = serde_json::json!(reason);
                }
                Json(body).into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let signature = headers
        .get("X-Signature")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    process_webhook(&state, &token, signature.as_deref(), &body)
        .await
        .into_response()
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Resolve the token against every recorder row without early exit, so a
/// near-miss takes the same time as a total miss.
fn resolve_token(entries: &[WebhookTokenEntry], token: &str) -> Option<WebhookTokenEntry> {
    let mut found: Option<WebhookTokenEntry> = None;
    for entry in entries {
        if constant_time_eq(entry.token.as_bytes(), token.as_bytes()) {
            found = Some(entry.clone());
        }
    }
    found
}

/// HMAC-SHA256 of the raw body, hex-encoded, compared in constant time.
fn verify_signature(secret: &str, body: &str, presented: Option<&str>) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(expected.as_bytes(), presented.trim().to_ascii_lowercase().as_bytes())
}

/// The full webhook pipeline, HTTP-free for testability.
pub async fn process_webhook(
    state: &Arc<AppState>,
    token: &str,
    signature: Option<&str>,
    body: &str,
) -> WebhookReply {
    if !state.accepting_webhooks.load(Ordering::Relaxed) {
        return WebhookReply::ShuttingDown;
    }

    // ── Token resolution ────────────────────────────────────────────────
    if token.len() != TOKEN_LEN {
        return WebhookReply::NotFound;
    }
    let entries = match state.store.webhook_token_entries().await {
        Ok(entries) => entries,
        Err(e) => {
            state.push_error(format!("token lookup failed: {e}"), None);
            return WebhookReply::NotFound;
        }
    };
    let Some(entry) = resolve_token(&entries, token) else {
        debug!("webhook token did not resolve");
        return WebhookReply::NotFound;
    };

    // ── Signature verification ──────────────────────────────────────────
    if let Some(secret) = &entry.secret {
        if !verify_signature(secret, body, signature) {
            warn!(recorder_id = entry.recorder_id, "webhook signature verification failed");
            return WebhookReply::NotFound;
        }
    }

    // ── Rate limit ──────────────────────────────────────────────────────
    if !state.webhook_rate.allow(entry.recorder_id) {
        return reject(state, entry.recorder_id, "", "", "rate_limited");
    }

    // ── Parse ───────────────────────────────────────────────────────────
    let payload = match SignalPayload::parse(body) {
        Ok(p) => p,
        Err(e) => {
            debug!(recorder_id = entry.recorder_id, error = %e, "webhook body rejected");
            return WebhookReply::BadRequest(e);
        }
    };

    // ── Dedup ───────────────────────────────────────────────────────────
    let (fresh, key) = state.dedup.observe(token, body);
    if !fresh {
        debug!(recorder_id = entry.recorder_id, "duplicate webhook collapsed");
        return WebhookReply::Deduplicated;
    }

    // ── Recorder + engine mode ──────────────────────────────────────────
    let recorder = match state.store.get_recorder(entry.recorder_id).await {
        Ok(Some(r)) => r,
        Ok(None) => return WebhookReply::NotFound,
        Err(e) => {
            state.push_error(format!("recorder lookup failed: {e}"), None);
            return WebhookReply::NotFound;
        }
    };

    let ticker = payload
        .ticker
        .clone()
        .unwrap_or_else(|| recorder.symbol.clone());
    let action_str = payload.action.to_string();

    let mode = state.runtime_config.read().trading_mode;
    if mode != TradingMode::Live {
        return reject(state, recorder.id, &action_str, &ticker, "engine_paused");
    }

    // The watcher marks positions off this cache; a signal price is the
    // freshest quote we have for the instrument.
    state.oracle.record(&ticker, payload.price);

    // ── Filter pipeline ─────────────────────────────────────────────────
    let now = Utc::now();
    let offset = recorder.filters.session_offset_minutes();
    let counters = state.session_risk.counters(recorder.id, offset, now);
    let realized_today = state
        .store
        .realized_pnl_since(recorder.id, &session_day_start(now, offset))
        .await
        .unwrap_or_default();

    let ctx = FilterContext {
        last_accepted_at: counters.last_accepted_at,
        accepted_in_session: counters.accepted_in_session,
        raw_seen: counters.raw_seen,
        realized_today,
    };
    let base_quantity = match state.store.get_open_position(recorder.id, &ticker).await {
        Ok(Some(_)) => recorder.add_size,
        _ => recorder.initial_size,
    };
    let decision = filters::evaluate(
        recorder.enabled,
        &recorder.filters,
        payload.action,
        now,
        base_quantity,
        &ctx,
    );
    if decision.counted_raw {
        state.session_risk.note_raw(recorder.id);
    }
    if !decision.accepted {
        let reason = decision.reason.unwrap_or_else(|| "rejected".into());
        return reject(state, recorder.id, &action_str, &ticker, &reason);
    }
    let transformed_quantity = decision.transformed_quantity;
    state.session_risk.note_accepted(recorder.id, now);

    // ── Position state machine (single transaction) ─────────────────────
    let point_value = point_value_or_default(&ticker_root(&ticker));
    let sizing = Sizing {
        initial_size: recorder.initial_size,
        add_size: recorder.add_size,
        reverse_on_opposite: recorder.reverse_on_opposite,
    };
    let applied = match state
        .tracker
        .apply_signal(
            recorder.id,
            &ticker,
            payload.action,
            payload.price,
            sizing,
            point_value,
            body,
            &key,
        )
        .await
    {
        Ok(applied) => applied,
        Err(e) => {
            state.push_error(format!("signal transaction failed: {e}"), None);
            return reject(state, recorder.id, &action_str, &ticker, "internal_error");
        }
    };

    // ── Bracket attachment + position events ────────────────────────────
    let native = state.adapter.supports_native_brackets();
    for effect in &applied.effects {
        match effect {
            PositionEffect::Open { position_id, .. } => {
                if let Ok(Some(pos)) = state.store.get_open_position(recorder.id, &ticker).await {
                    if pos.id == *position_id {
                        state
                            .bracket_book
                            .attach_from_spec(&pos, &recorder.bracket, native);
                        state.bus.publish(EngineEvent::PositionUpdate {
                            recorder_id: recorder.id,
                            ticker: ticker.clone(),
                            side: pos.side,
                            qty: pos.total_quantity,
                            avg_price: pos.avg_entry_price,
                            status: pos.status,
                            unrealized_pnl: pos.unrealized_pnl,
                            worst_unrealized_pnl: pos.worst_unrealized_pnl,
                        });
                    }
                }
            }
            PositionEffect::Add {
                side,
                new_total,
                new_avg,
                ..
            } => {
                state.bus.publish(EngineEvent::PositionUpdate {
                    recorder_id: recorder.id,
                    ticker: ticker.clone(),
                    side: *side,
                    qty: *new_total,
                    avg_price: *new_avg,
                    status: crate::store::PositionStatus::Open,
                    unrealized_pnl: rust_decimal::Decimal::ZERO,
                    worst_unrealized_pnl: rust_decimal::Decimal::ZERO,
                });
            }
            PositionEffect::Close {
                position_id,
                side,
                exit_price,
                realized_pnl,
                ..
            } => {
                state.bracket_book.remove_position(position_id);
                state.bus.publish(EngineEvent::PositionUpdate {
                    recorder_id: recorder.id,
                    ticker: ticker.clone(),
                    side: *side,
                    qty: 0,
                    avg_price: *exit_price,
                    status: crate::store::PositionStatus::Closed,
                    unrealized_pnl: rust_decimal::Decimal::ZERO,
                    worst_unrealized_pnl: *realized_pnl,
                });
            }
            PositionEffect::Trim { .. } | PositionEffect::NoOp => {}
        }
    }

    // ── Fan-out ─────────────────────────────────────────────────────────
    let dispatched = match state
        .dispatcher
        .dispatch(&recorder, &applied.signal, &applied.effects)
        .await
    {
        Ok(n) => n,
        Err(e) => {
            state.push_error(format!("dispatch failed: {e}"), None);
            0
        }
    };

    info!(
        recorder_id = recorder.id,
        signal_id = %applied.signal.id,
        action = %action_str,
        ticker = %ticker,
        dispatched,
        "signal accepted"
    );
    record_decision(
        state,
        recorder.id,
        &action_str,
        &ticker,
        true,
        None,
        transformed_quantity,
        dispatched,
    );
    state.increment_version();

    WebhookReply::Decision {
        accepted: true,
        reason: None,
        dispatched,
    }
}

/// Shared rejection path: audit the decision, mirror it to the bus, and
/// answer 200 with `accepted=false` (a filtered signal is not an error).
fn reject(
    state: &Arc<AppState>,
    recorder_id: i64,
    action: &str,
    ticker: &str,
    reason: &str,
) -> WebhookReply {
    debug!(recorder_id, reason, "signal rejected");
    record_decision(state, recorder_id, action, ticker, false, Some(reason), None, 0);
    WebhookReply::Decision {
        accepted: false,
        reason: Some(reason.to_string()),
        dispatched: 0,
    }
}

#[allow(clippy::too_many_arguments)]
fn record_decision(
    state: &Arc<AppState>,
    recorder_id: i64,
    action: &str,
    ticker: &str,
    accepted: bool,
    reason: Option<&str>,
    transformed_quantity: Option<i64>,
    dispatched: u32,
) {
    let record = DecisionRecord {
        id: Uuid::new_v4().to_string(),
        recorder_id,
        action: action.to_string(),
        ticker: ticker.to_string(),
        accepted,
        reason: reason.map(|r| r.to_string()),
        transformed_quantity,
        dispatched,
        created_at: Utc::now().to_rfc3339(),
    };
    state.bus.log(
        if accepted { "info" } else { "warn" },
        "filters",
        if accepted { "signal accepted" } else { "signal rejected" },
        serde_json::json!({
            "recorder_id": recorder_id,
            "action": action,
            "ticker": ticker,
            "accepted": accepted,
            "reason": reason,
            "transformed_quantity": transformed_quantity,
            "dispatched": dispatched,
        }),
    );
    state.push_decision(record);
}
