// =============================================================================
// Webhook Rate Limiter — per-recorder sliding-minute admission counter
// =============================================================================
//
// TradingView retries aggressively and a misconfigured alert can fire every
// bar. The limiter caps how many webhook posts per recorder enter the
// pipeline each minute; excess posts are answered 200 with
// `accepted=false, reason="rate_limited"` so the publisher never retries
// harder.
// =============================================================================

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Counter state for one recorder's current minute window.
struct Window {
    started: Instant,
    count: u32,
}

/// Immutable snapshot for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub recorder_id: i64,
    pub count_this_minute: u32,
    pub limit: u32,
}

/// Thread-safe per-recorder rate limiter.
pub struct WebhookRateLimiter {
    max_per_minute: u32,
    windows: Mutex<HashMap<i64, Window>>,
}

impl WebhookRateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or refuse one post for a recorder. The window restarts sixty
    /// seconds after its first admitted post.
    pub fn allow(&self, recorder_id: i64) -> bool {
        if self.max_per_minute == 0 {
            return true;
        }

        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(recorder_id).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started).as_secs() >= 60 {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.max_per_minute {
            warn!(
                recorder_id,
                count = window.count,
                limit = self.max_per_minute,
                "webhook rate limit hit"
            );
            return false;
        }
        window.count += 1;
        true
    }

    pub fn snapshot(&self) -> Vec<RateLimitSnapshot> {
        let now = Instant::now();
        self.windows
            .lock()
            .iter()
            .map(|(id, w)| RateLimitSnapshot {
                recorder_id: *id,
                count_this_minute: if now.duration_since(w.started).as_secs() >= 60 {
                    0
                } else {
                    w.count
                },
                limit: self.max_per_minute,
            })
            .collect()
    }
}

impl std::fmt::Debug for WebhookRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRateLimiter")
            .field("max_per_minute", &self.max_per_minute)
            .field("recorders", &self.windows.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_then_refuses() {
        let limiter = WebhookRateLimiter::new(3);
        assert!(limiter.allow(1));
        assert!(limiter.allow(1));
        assert!(limiter.allow(1));
        assert!(!limiter.allow(1));
    }

    #[test]
    fn recorders_have_independent_windows() {
        let limiter = WebhookRateLimiter::new(1);
        assert!(limiter.allow(1));
        assert!(!limiter.allow(1));
        assert!(limiter.allow(2));
    }

    #[test]
    fn zero_limit_disables_the_limiter() {
        let limiter = WebhookRateLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.allow(1));
        }
    }

    #[test]
    fn snapshot_reports_current_counts() {
        let limiter = WebhookRateLimiter::new(10);
        limiter.allow(7);
        limiter.allow(7);
        let snap = limiter.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].recorder_id, 7);
        assert_eq!(snap[0].count_this_minute, 2);
    }
}
