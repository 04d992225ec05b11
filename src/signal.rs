// =============================================================================
// Signal Payload — validated webhook body plus the replay/dedup cache
// =============================================================================
//
// TradingView sends loosely-typed JSON; everything is validated here at the
// edge so nothing downstream ever sees an unknown action or a garbage
// price. Unknown actions and non-positive prices are rejected with a 400.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::types::Action;

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Raw webhook body shape. `price` tolerates both string and number forms.
#[derive(Debug, Deserialize)]
struct RawPayload {
    action: String,
    #[serde(default)]
    ticker: Option<String>,
    price: serde_json::Value,
    #[serde(default)]
    recorder: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    nonce: Option<String>,
}

/// A validated signal payload.
#[derive(Debug, Clone)]
pub struct SignalPayload {
    pub action: Action,
    /// Absent tickers fall back to the recorder's default symbol.
    pub ticker: Option<String>,
    pub price: Decimal,
    pub recorder: Option<String>,
}

impl SignalPayload {
    /// Parse and validate a webhook body. The error string is returned to
    /// the caller inside the 400 response.
    pub fn parse(body: &str) -> Result<Self, String> {
        let raw: RawPayload =
            serde_json::from_str(body).map_err(|e| format!("malformed JSON: {e}"))?;

        let action = Action::parse(&raw.action)
            .ok_or_else(|| format!("unknown action '{}'", raw.action))?;

        let price_str = match &raw.price {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => return Err(format!("price must be a decimal string, got {other}")),
        };
        let price: Decimal = price_str
            .trim()
            .parse()
            .map_err(|_| format!("unparseable price '{price_str}'"))?;
        if price <= Decimal::ZERO {
            return Err(format!("non-positive price '{price}'"));
        }

        let ticker = raw
            .ticker
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Ok(Self {
            action,
            ticker,
            price,
            recorder: raw.recorder,
        })
    }
}

// ---------------------------------------------------------------------------
// Dedup cache
// ---------------------------------------------------------------------------

/// Replay key: `sha256(token | body | truncated_wall_timestamp)`, where the
/// timestamp is the wall clock truncated to the dedup window (`bucket` is
/// `wall_seconds / window`).
pub fn dedup_key(token: &str, body: &str, bucket: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(b"|");
    hasher.update(body.as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Sliding-window replay rejection. A byte-identical body whose key was
/// observed within the window is a duplicate. Because the key truncates the
/// wall clock into buckets, the lookup also checks the previous bucket's
/// key — two identical posts straddling a bucket boundary still collapse.
pub struct DedupCache {
    seen: Mutex<HashMap<String, Instant>>,
    window_seconds: u64,
}

impl DedupCache {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window_seconds,
        }
    }

    /// Observe one webhook post. Returns `(fresh, key)` — the key is the
    /// current-bucket dedup key, persisted on the signal row.
    pub fn observe(&self, token: &str, body: &str) -> (bool, String) {
        let wall_seconds = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.observe_at(token, body, wall_seconds)
    }

    fn observe_at(&self, token: &str, body: &str, wall_seconds: u64) -> (bool, String) {
        if self.window_seconds == 0 {
            // Window disabled: every post is fresh; key the raw second.
            return (true, dedup_key(token, body, wall_seconds));
        }

        let bucket = wall_seconds / self.window_seconds;
        let key = dedup_key(token, body, bucket);
        let previous = dedup_key(token, body, bucket.wrapping_sub(1));

        let now = Instant::now();
        let window = Duration::from_secs(self.window_seconds);
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < window);

        if seen.contains_key(&key) || seen.contains_key(&previous) {
            return (false, key);
        }
        seen.insert(key.clone(), now);
        (true, key)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}
