// =============================================================================
// Admin Authentication — bearer check for the REST/WS surface
// =============================================================================
//
// Two credentials live in this engine: the per-recorder webhook token (the
// URL path *is* the credential) and the single operator token in
// `RELAY_ADMIN_TOKEN` guarding everything under /api. Both are compared
// through `constant_time_eq` so response timing never narrows a guess —
// the webhook edge reuses it for token and HMAC matching.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Timing-independent equality. The scan always covers the longer of the
/// two slices and the length difference is folded into the accumulator, so
/// neither an early mismatch nor a short candidate returns faster.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut acc = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0) as usize;
        let y = b.get(i).copied().unwrap_or(0) as usize;
        acc |= x ^ y;
    }
    acc == 0
}

// =============================================================================
// Extractor
// =============================================================================

/// Admin bearer extractor. Handlers list it as a parameter; a request that
/// fails the check never reaches the handler body. Yields the presented
/// token for audit logging.
pub struct AuthBearer(pub String);

/// Why an admin request was refused. Everything maps to 403 so probes learn
/// nothing from the status, only the body message differs for operators
/// reading their own logs.
pub enum AuthRejection {
    Unconfigured,
    Missing,
    Invalid,
}

impl AuthRejection {
    fn message(&self) -> &'static str {
        match self {
            Self::Unconfigured => "Server authentication not configured",
            Self::Missing => "Missing or invalid authorization token",
            Self::Invalid => "Invalid authorization token",
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message() });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

/// The configured admin token, if any. Read per call so rotating the env
/// var does not require a restart.
fn admin_token() -> Option<String> {
    std::env::var("RELAY_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
}

fn bearer_of(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(expected) = admin_token() else {
            warn!("RELAY_ADMIN_TOKEN is not set — all admin requests will be rejected");
            return Err(AuthRejection::Unconfigured);
        };

        let Some(presented) = bearer_of(parts) else {
            warn!("admin request without a Bearer authorization header");
            return Err(AuthRejection::Missing);
        };

        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!("admin request with a wrong token");
            return Err(AuthRejection::Invalid);
        }

        Ok(AuthBearer(presented.to_string()))
    }
}

// =============================================================================
// Token validation helper (WebSocket query-param auth)
// =============================================================================

/// Same check for contexts where the extractor is not usable (WebSocket
/// upgrade passes the token as `?token=`).
pub fn validate_token(token: &str) -> bool {
    match admin_token() {
        Some(expected) => constant_time_eq(token.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::generate_webhook_token;

    #[test]
    fn same_webhook_token_matches() {
        let token = generate_webhook_token();
        assert!(constant_time_eq(token.as_bytes(), token.as_bytes()));
    }

    #[test]
    fn two_generated_tokens_differ() {
        // 128-bit tokens; a collision here means the generator is broken.
        let a = generate_webhook_token();
        let b = generate_webhook_token();
        assert!(!constant_time_eq(a.as_bytes(), b.as_bytes()));
    }

    #[test]
    fn truncated_token_is_rejected() {
        let token = generate_webhook_token();
        assert!(!constant_time_eq(token[..16].as_bytes(), token.as_bytes()));
        assert!(!constant_time_eq(token.as_bytes(), b""));
    }

    #[test]
    fn one_hex_digit_off_is_rejected() {
        let token = generate_webhook_token();
        let mut wrong = token.clone().into_bytes();
        // Flip the last hex digit to a different one.
        wrong[31] = if wrong[31] == b'0' { b'1' } else { b'0' };
        assert!(!constant_time_eq(token.as_bytes(), &wrong));
    }

    #[test]
    fn signature_length_hex_strings_compare() {
        // 64-char lowercase hex, the same shape the webhook HMAC check
        // feeds through this function.
        let sig = "a".repeat(64);
        assert!(constant_time_eq(sig.as_bytes(), sig.as_bytes()));
        let mut other = sig.clone();
        other.replace_range(0..1, "b");
        assert!(!constant_time_eq(sig.as_bytes(), other.as_bytes()));
    }

    #[test]
    fn empty_inputs_are_equal() {
        assert!(constant_time_eq(b"", b""));
    }
}
