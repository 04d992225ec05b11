// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Relay copy engine.  Every tunable lives
// here so that the engine can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.  Environment variables override
// file values at boot (see `apply_env_overrides`).
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_worker_pool_size() -> usize {
    4
}

fn default_token_refresh_skew_seconds() -> u64 {
    120
}

fn default_token_refresh_ahead_seconds() -> u64 {
    7200
}

fn default_token_scan_interval_seconds() -> u64 {
    30
}

fn default_drawdown_tick_ms() -> u64 {
    1000
}

fn default_dedup_window_seconds() -> u64 {
    60
}

fn default_broker_timeout_ms() -> u64 {
    10_000
}

fn default_keepalive_interval_seconds() -> u64 {
    30
}

fn default_reconcile_interval_seconds() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_drain_cap_seconds() -> u64 {
    30
}

fn default_webhook_rate_per_minute() -> u32 {
    120
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_db_path() -> String {
    "relay.db".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Relay engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational mode ----------------------------------------------------

    /// Current trading mode: Live, Paused, or Killed. Paused/Killed engines
    /// still record signals but reject them at the filter pipeline.
    #[serde(default)]
    pub trading_mode: TradingMode,

    // --- Execution -----------------------------------------------------------

    /// Number of execution workers draining the order queue.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Bounded capacity of the execution queue (tasks, across partitions).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-call broker timeout in milliseconds.
    #[serde(default = "default_broker_timeout_ms")]
    pub default_broker_timeout_ms: u64,

    /// Cap on draining the execution queue at shutdown, in seconds.
    #[serde(default = "default_drain_cap_seconds")]
    pub drain_cap_seconds: u64,

    // --- Token lifecycle -----------------------------------------------------

    /// A cached token is considered stale this many seconds before its
    /// actual expiry.
    #[serde(default = "default_token_refresh_skew_seconds")]
    pub token_refresh_skew_seconds: u64,

    /// The refresh-ahead daemon renews any token expiring within this
    /// window.
    #[serde(default = "default_token_refresh_ahead_seconds")]
    pub token_refresh_ahead_seconds: u64,

    /// How often the refresh-ahead daemon scans the cache.
    #[serde(default = "default_token_scan_interval_seconds")]
    pub token_scan_interval_seconds: u64,

    // --- Periodic services ---------------------------------------------------

    /// Drawdown poller / bracket watcher tick, in milliseconds.
    #[serde(default = "default_drawdown_tick_ms")]
    pub drawdown_tick_ms: u64,

    /// Pooled-session keep-alive ping interval, in seconds.
    #[serde(default = "default_keepalive_interval_seconds")]
    pub keepalive_interval_seconds: u64,

    /// Broker reconciliation audit interval, in seconds.
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,

    // --- Webhook edge --------------------------------------------------------

    /// Window within which a byte-identical webhook body is collapsed into
    /// a single processing event.
    #[serde(default = "default_dedup_window_seconds")]
    pub dedup_window_seconds: u64,

    /// Per-recorder webhook rate limit (accepted posts per minute).
    #[serde(default = "default_webhook_rate_per_minute")]
    pub webhook_rate_per_minute: u32,

    // --- OAuth ---------------------------------------------------------------

    /// Fully-qualified HTTPS redirect URI registered with the broker.
    #[serde(default)]
    pub oauth_redirect_uri: String,

    // --- Server --------------------------------------------------------------

    /// Address the HTTP server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Path of the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            worker_pool_size: default_worker_pool_size(),
            queue_capacity: default_queue_capacity(),
            default_broker_timeout_ms: default_broker_timeout_ms(),
            drain_cap_seconds: default_drain_cap_seconds(),
            token_refresh_skew_seconds: default_token_refresh_skew_seconds(),
            token_refresh_ahead_seconds: default_token_refresh_ahead_seconds(),
            token_scan_interval_seconds: default_token_scan_interval_seconds(),
            drawdown_tick_ms: default_drawdown_tick_ms(),
            keepalive_interval_seconds: default_keepalive_interval_seconds(),
            reconcile_interval_seconds: default_reconcile_interval_seconds(),
            dedup_window_seconds: default_dedup_window_seconds(),
            webhook_rate_per_minute: default_webhook_rate_per_minute(),
            oauth_redirect_uri: String::new(),
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            trading_mode = %config.trading_mode,
            workers = config.worker_pool_size,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Override file values with environment variables where set.
    ///
    /// Unparseable values are logged and skipped rather than aborting boot.
    pub fn apply_env_overrides(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
            if let Ok(raw) = std::env::var(name) {
                match raw.parse::<T>() {
                    Ok(v) => *slot = v,
                    Err(_) => warn!(var = name, value = %raw, "ignoring unparseable env override"),
                }
            }
        }

        env_parse("WORKER_POOL_SIZE", &mut self.worker_pool_size);
        env_parse(
            "TOKEN_REFRESH_SKEW_SECONDS",
            &mut self.token_refresh_skew_seconds,
        );
        env_parse("DRAWDOWN_TICK_MS", &mut self.drawdown_tick_ms);
        env_parse("DEDUP_WINDOW_SECONDS", &mut self.dedup_window_seconds);
        env_parse(
            "DEFAULT_BROKER_TIMEOUT_MS",
            &mut self.default_broker_timeout_ms,
        );
        if let Ok(uri) = std::env::var("OAUTH_REDIRECT_URI") {
            self.oauth_redirect_uri = uri;
        }
        if let Ok(addr) = std::env::var("RELAY_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(db) = std::env::var("RELAY_DB_PATH") {
            self.db_path = db;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.worker_pool_size, 4);
        assert_eq!(cfg.token_refresh_skew_seconds, 120);
        assert_eq!(cfg.drawdown_tick_ms, 1000);
        assert_eq!(cfg.dedup_window_seconds, 60);
        assert_eq!(cfg.default_broker_timeout_ms, 10_000);
        assert_eq!(cfg.keepalive_interval_seconds, 30);
        assert_eq!(cfg.queue_capacity, 1024);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.worker_pool_size, 4);
        assert_eq!(cfg.bind_addr, "0.0.0.0:3001");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "worker_pool_size": 8 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.worker_pool_size, 8);
        assert_eq!(cfg.dedup_window_seconds, 60);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.worker_pool_size, cfg2.worker_pool_size);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
        assert_eq!(cfg.db_path, cfg2.db_path);
    }
}
