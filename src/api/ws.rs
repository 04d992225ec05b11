// =============================================================================
// WebSocket Handler — typed event feed for browser clients
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<admin token>` and receive:
//   1. An immediate hello frame carrying the current state_version.
//   2. Every engine event (position_update, pnl_update,
//      strategy_pnl_update, trade_executed, log_entry) as it is published,
//      stamped with a per-subscriber monotonic sequence number.
//
// A subscriber that falls behind its buffer is disconnected (broadcast
// Lagged) rather than applying backpressure to producers. Ping frames are
// answered with Pong; Close ends the session cleanly.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

/// Validates the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.bus.subscribe();
    let (mut sender, mut receiver) = socket.split();
    let mut sequence: u64 = 0;

    // Hello frame so the client can detect missed history via
    // state_version.
    let hello = serde_json::json!({
        "type": "hello",
        "seq": sequence,
        "state_version": state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    });
    if let Ok(json) = serde_json::to_string(&hello) {
        if sender.send(Message::Text(json)).await.is_err() {
            info!("WebSocket closed before hello");
            return;
        }
    }

    loop {
        tokio::select! {
            // ── Event feed ──────────────────────────────────────────────
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        sequence += 1;
                        let mut value = match serde_json::to_value(&event) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize engine event");
                                continue;
                            }
                        };
                        if let Some(obj) = value.as_object_mut() {
                            obj.insert("seq".to_string(), serde_json::json!(sequence));
                        }
                        let json = value.to_string();
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Slow subscriber policy: drop rather than slow
                        // the producers down.
                        warn!(missed, "WebSocket subscriber lagged — disconnecting");
                        break;
                    }
                    Err(RecvError::Closed) => {
                        info!("event bus closed — ending WebSocket session");
                        break;
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("WebSocket Pong received");
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Client heartbeats arrive as text; no action.
                        debug!(msg = %text, "WebSocket text message received");
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!(events_sent = sequence, "WebSocket connection closed");
}
