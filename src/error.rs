// =============================================================================
// Broker error taxonomy — closed kind set shared by the adapter, the token
// cache, and the execution workers
// =============================================================================
//
// POLICY: broker errors never unwind across the queue boundary. Workers
// convert every variant into a log event plus a rejected trade event; only
// token errors propagate upward, and only as far as the token cache.
// =============================================================================

use thiserror::Error;

/// Every way a broker operation can fail.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The cached access token is past its expiry. Recoverable via refresh.
    #[error("access token expired for account {account_id}")]
    TokenExpired { account_id: i64 },

    /// The identity endpoint rejected the refresh token (`invalid_grant`).
    /// The account requires re-authorization by the user.
    #[error("token invalid for account {account_id}: {detail}")]
    TokenInvalid { account_id: i64, detail: String },

    /// The broker explicitly rejected the request. Never retried.
    #[error("broker rejected: {detail}")]
    Rejected { detail: String },

    /// The request timed out. The order may or may not have reached the
    /// broker, so this is treated exactly like a rejection.
    #[error("broker call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The transport failed before anything was submitted (DNS, connection
    /// refused). The only variant the adapter may retry internally.
    #[error("broker unreachable: {detail}")]
    Unreachable { detail: String },

    /// Internal logic bug (e.g. a negative computed quantity). Logged at
    /// fatal, counted, and the work item dropped; the service continues.
    #[error("invariant violation: {detail}")]
    InvariantViolation { detail: String },
}

impl BrokerError {
    /// Stable lowercase tag used in log events and `trade_executed` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenExpired { .. } => "token_expired",
            Self::TokenInvalid { .. } => "token_invalid",
            Self::Rejected { .. } => "broker_rejected",
            Self::Timeout { .. } => "broker_timeout",
            Self::Unreachable { .. } => "transport_unreachable",
            Self::InvariantViolation { .. } => "invariant_violation",
        }
    }

    /// Whether the adapter may attempt a transport-level retry. Only true
    /// for failures that provably never reached the broker.
    pub fn retryable_pre_submit(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// Whether the failure should be escalated to the token cache instead
    /// of being absorbed by the worker.
    pub fn is_token_error(&self) -> bool {
        matches!(self, Self::TokenExpired { .. } | Self::TokenInvalid { .. })
    }
}

/// Convenience alias used throughout the broker layer.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_tags() {
        let e = BrokerError::Rejected {
            detail: "Insufficient margin".into(),
        };
        assert_eq!(e.kind(), "broker_rejected");
        assert!(!e.retryable_pre_submit());

        let t = BrokerError::Timeout { timeout_ms: 10_000 };
        assert_eq!(t.kind(), "broker_timeout");
        assert!(!t.retryable_pre_submit());

        let u = BrokerError::Unreachable {
            detail: "connection refused".into(),
        };
        assert!(u.retryable_pre_submit());
    }

    #[test]
    fn token_errors_escalate() {
        assert!(BrokerError::TokenExpired { account_id: 1 }.is_token_error());
        assert!(BrokerError::TokenInvalid {
            account_id: 1,
            detail: "invalid_grant".into()
        }
        .is_token_error());
        assert!(!BrokerError::Rejected {
            detail: "x".into()
        }
        .is_token_error());
    }
}
