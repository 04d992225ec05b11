// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The webhook endpoint is public (its token is the credential). Health is
// public. Every other endpoint requires the admin bearer token via the
// `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::{Environment, TradingMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Signal ingress (token-authenticated by path) ─────────────
        .route("/webhook/:token", post(crate::api::webhook::webhook_handler))
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Status ──────────────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/websocket-status", get(websocket_status))
        .route(
            "/api/recorders/:id/execution-status",
            get(execution_status),
        )
        // ── Recorders ───────────────────────────────────────────────
        .route("/api/v1/recorders", get(list_recorders))
        .route("/api/v1/recorders/:id/positions", get(recorder_positions))
        .route("/api/v1/recorders/:id/journal", get(recorder_journal))
        .route("/api/v1/recorders/:id/pause", post(recorder_pause))
        .route("/api/v1/recorders/:id/resume", post(recorder_resume))
        .route(
            "/api/v1/recorders/:id/rotate-token",
            post(recorder_rotate_token),
        )
        // ── Traders ─────────────────────────────────────────────────
        .route(
            "/api/v1/recorders/:id/traders",
            get(list_traders).post(create_trader),
        )
        .route("/api/v1/traders/:id", axum::routing::delete(delete_trader))
        .route("/api/v1/traders/:id/pause", post(trader_pause))
        .route("/api/v1/traders/:id/resume", post(trader_resume))
        // ── Trades ──────────────────────────────────────────────────
        .route("/api/v1/trades", get(recent_trades))
        // ── Accounts ────────────────────────────────────────────────
        .route("/api/v1/accounts/connect", post(account_connect))
        .route("/api/v1/accounts/:id/disconnect", post(account_disconnect))
        // ── Engine control ──────────────────────────────────────────
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        // ── WebSocket event feed ────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Full state snapshot
// =============================================================================

async fn full_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.build_snapshot().await)
}

// =============================================================================
// Status endpoints
// =============================================================================

async fn websocket_status(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "pool_size": state.pool.size(),
        "sessions": state.pool.health(),
        "token_health": state.tokens.health(),
        "event_subscribers": state.bus.subscriber_count(),
        "webhook_rate": state.webhook_rate.snapshot(),
    }))
}

async fn execution_status(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let recorder = state
        .store
        .get_recorder(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let trader_count = state
        .store
        .count_enabled_traders(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let targets = state
        .store
        .list_enabled_trader_targets(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let enabled_accounts: Vec<i64> = {
        let mut ids: Vec<i64> = targets.iter().map(|t| t.account_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    };

    let last_error = state
        .recent_errors
        .read()
        .iter()
        .rev()
        .next()
        .map(|e| e.message.clone());

    Ok(Json(serde_json::json!({
        "recorder_id": recorder.id,
        "enabled": recorder.enabled,
        "trader_link_count": trader_count,
        "enabled_accounts": enabled_accounts,
        "worker_pool_depth": state.queue.depth(),
        "accepted_today": state.session_risk.accepted_today(id),
        "last_error": last_error,
    })))
}

// =============================================================================
// Recorders
// =============================================================================

async fn list_recorders(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, StatusCode> {
    let recorders = state
        .store
        .list_recorders()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(recorders))
}

async fn recorder_positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let open = state
        .store
        .list_open_positions_for(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let closed = state
        .store
        .list_closed_positions(id, 100)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({ "open": open, "closed": closed })))
}

async fn recorder_journal(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let closed = state
        .store
        .list_closed_positions(id, 500)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let total_trades = closed.len();
    let wins = closed
        .iter()
        .filter(|p| p.realized_pnl > Decimal::ZERO)
        .count();
    let win_rate = if total_trades > 0 {
        wins as f64 / total_trades as f64
    } else {
        0.0
    };
    let total_net_pnl: Decimal = closed.iter().map(|p| p.realized_pnl).sum();
    let gross_profit: Decimal = closed
        .iter()
        .map(|p| p.realized_pnl)
        .filter(|pnl| *pnl > Decimal::ZERO)
        .sum();
    let gross_loss: Decimal = closed
        .iter()
        .map(|p| p.realized_pnl)
        .filter(|pnl| *pnl < Decimal::ZERO)
        .map(|pnl| -pnl)
        .sum();
    let profit_factor = if gross_loss > Decimal::ZERO {
        Some(gross_profit / gross_loss)
    } else {
        None
    };

    Ok(Json(serde_json::json!({
        "positions": closed,
        "stats": {
            "total_trades": total_trades,
            "win_rate": win_rate,
            "total_net_pnl": total_net_pnl,
            "profit_factor": profit_factor,
        }
    })))
}

async fn recorder_pause(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    set_recorder_enabled(&state, id, false).await
}

async fn recorder_resume(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    set_recorder_enabled(&state, id, true).await
}

async fn set_recorder_enabled(
    state: &Arc<AppState>,
    id: i64,
    enabled: bool,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let updated = state
        .store
        .set_recorder_enabled(id, enabled)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !updated {
        return Err(StatusCode::NOT_FOUND);
    }
    info!(recorder_id = id, enabled, "recorder enabled flag changed via API");
    state.increment_version();
    Ok(Json(serde_json::json!({ "recorder_id": id, "enabled": enabled })))
}

async fn recorder_rotate_token(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let token = state
        .store
        .rotate_webhook_token(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    info!(recorder_id = id, "webhook token rotated — old token is dead");
    state.increment_version();
    Ok(Json(serde_json::json!({ "recorder_id": id, "webhook_token": token })))
}

// =============================================================================
// Traders
// =============================================================================

async fn list_traders(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let traders = state
        .store
        .list_traders(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(traders))
}

#[derive(Deserialize)]
struct CreateTraderRequest {
    subaccount_id: i64,
    multiplier: Decimal,
    #[serde(default)]
    bracket_override: Option<crate::types::BracketSpec>,
    #[serde(default)]
    max_contracts_override: Option<i64>,
}

async fn create_trader(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<CreateTraderRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if req.multiplier <= Decimal::ZERO {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "multiplier must be positive" })),
        ));
    }
    let trader_id = state
        .store
        .insert_trader(
            id,
            req.subaccount_id,
            req.multiplier,
            req.bracket_override.as_ref(),
            req.max_contracts_override,
        )
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        })?;
    info!(recorder_id = id, trader_id, "trader link created");
    state.increment_version();
    Ok(Json(serde_json::json!({ "trader_id": trader_id })))
}

async fn delete_trader(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let deleted = state
        .store
        .delete_trader(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !deleted {
        return Err(StatusCode::NOT_FOUND);
    }
    info!(trader_id = id, "trader link deleted");
    state.increment_version();
    Ok(Json(serde_json::json!({ "trader_id": id, "deleted": true })))
}

async fn trader_pause(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    set_trader_enabled(&state, id, false).await
}

async fn trader_resume(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    set_trader_enabled(&state, id, true).await
}

async fn set_trader_enabled(
    state: &Arc<AppState>,
    id: i64,
    enabled: bool,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let updated = state
        .store
        .set_trader_enabled(id, enabled)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !updated {
        return Err(StatusCode::NOT_FOUND);
    }
    info!(trader_id = id, enabled, "trader enabled flag changed via API");
    state.increment_version();
    Ok(Json(serde_json::json!({ "trader_id": id, "enabled": enabled })))
}

// =============================================================================
// Trades
// =============================================================================

async fn recent_trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, StatusCode> {
    let trades = state
        .store
        .list_recent_trades(200)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(trades))
}

// =============================================================================
// Accounts
// =============================================================================

#[derive(Deserialize)]
struct ConnectRequest {
    user_id: i64,
    name: String,
    environment: Environment,
    client_id: String,
    client_secret: String,
    code: String,
}

async fn account_connect(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let redirect_uri = state.runtime_config.read().oauth_redirect_uri.clone();

    let grant = state
        .adapter
        .exchange_auth_code(
            req.environment,
            &req.client_id,
            &req.client_secret,
            &req.code,
            &redirect_uri,
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "OAuth code exchange failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": format!("code exchange failed: {e}") })),
            )
        })?;

    let account_id = state
        .store
        .insert_account(
            req.user_id,
            &req.name,
            req.environment,
            &req.client_id,
            &req.client_secret,
        )
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        })?;

    state
        .store
        .update_account_refresh_token(
            account_id,
            &grant.refresh_token,
            &grant.expires_at.to_rfc3339(),
        )
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        })?;
    state
        .tokens
        .insert_grant(account_id, grant.access_token, grant.expires_at);

    info!(account_id, environment = %req.environment, "broker account connected");
    state.increment_version();
    Ok(Json(serde_json::json!({
        "account_id": account_id,
        "token_expires_at": grant.expires_at.to_rfc3339(),
    })))
}

async fn account_disconnect(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .store
        .soft_delete_account(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state.pool.remove_for_account(id);

    info!(account_id = id, "broker account disconnected — tokens revoked, sessions closed");
    state.increment_version();
    Ok(Json(serde_json::json!({ "account_id": id, "deleted": true })))
}

// =============================================================================
// Engine control
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn control_pause(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    {
        let mut config = state.runtime_config.write();
        config.trading_mode = TradingMode::Paused;
    }
    state.increment_version();
    info!("signal intake PAUSED via API");

    Json(ControlResponse {
        trading_mode: "Paused".to_string(),
        message: "Signal intake paused".to_string(),
    })
}

async fn control_resume(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    {
        let mut config = state.runtime_config.write();
        config.trading_mode = TradingMode::Live;
    }
    state.increment_version();
    info!("signal intake RESUMED via API");

    Json(ControlResponse {
        trading_mode: "Live".to_string(),
        message: "Signal intake resumed".to_string(),
    })
}
