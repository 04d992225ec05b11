// =============================================================================
// Token Cache — per-account access tokens with serialized renewal and a
// refresh-ahead daemon
// =============================================================================
//
// Renewal discipline: one renewal per account at a time. Callers that find
// a renewal in flight wait on the same per-account lock and read the
// refreshed entry instead of issuing a second refresh request.
//
// Failure handling per the token lifecycle policy:
//   - invalid_grant  -> mark the account requires_reauth, purge its tokens,
//                       surface to the operator via the event bus.
//   - transport/etc  -> exponential backoff (1s, 2s, 4s ... capped 30s);
//                       the stale token stays usable until its true expiry.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::adapter::BrokerAdapter;
use crate::error::{BrokerError, BrokerResult};
use crate::events::EventBus;
use crate::store::Store;

/// Backoff cap for failed renewals.
const BACKOFF_CAP_SECONDS: i64 = 30;

#[derive(Debug, Clone)]
struct TokenEntry {
    access_token: String,
    expires_at: DateTime<Utc>,
    consecutive_failures: u32,
    next_attempt_at: DateTime<Utc>,
}

/// Health snapshot of one cached account token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenHealth {
    pub account_id: i64,
    pub expires_at: String,
    pub seconds_to_expiry: i64,
    pub consecutive_failures: u32,
}

/// Per-account token store with expiry-aware lookup.
pub struct TokenCache {
    store: Store,
    adapter: Arc<dyn BrokerAdapter>,
    bus: EventBus,
    entries: RwLock<HashMap<i64, TokenEntry>>,
    renew_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    /// A token is treated as stale this long before its actual expiry.
    skew: Duration,
}

impl TokenCache {
    pub fn new(
        store: Store,
        adapter: Arc<dyn BrokerAdapter>,
        bus: EventBus,
        skew_seconds: u64,
    ) -> Self {
        Self {
            store,
            adapter,
            bus,
            entries: RwLock::new(HashMap::new()),
            renew_locks: Mutex::new(HashMap::new()),
            skew: Duration::seconds(skew_seconds as i64),
        }
    }

    fn renew_lock(&self, account_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.renew_locks.lock();
        locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cached_fresh(&self, account_id: i64, now: DateTime<Utc>) -> Option<String> {
        let entries = self.entries.read();
        let entry = entries.get(&account_id)?;
        (now + self.skew < entry.expires_at).then(|| entry.access_token.clone())
    }

    /// Current access token for an account, renewing first when the cached
    /// one is within the skew of expiry.
    pub async fn get(&self, account_id: i64) -> BrokerResult<String> {
        let now = Utc::now();
        if let Some(token) = self.cached_fresh(account_id, now) {
            return Ok(token);
        }
        self.renew(account_id).await
    }

    /// Renew the account's token, serialized per account. A second caller
    /// arriving mid-renewal waits for the holder and reads the fresh entry.
    pub async fn renew(&self, account_id: i64) -> BrokerResult<String> {
        let lock = self.renew_lock(account_id);
        let _guard = lock.lock().await;

        // The previous holder may have refreshed while we waited.
        let now = Utc::now();
        if let Some(token) = self.cached_fresh(account_id, now) {
            return Ok(token);
        }

        let account = self
            .store
            .get_account(account_id)
            .await
            .map_err(|e| BrokerError::InvariantViolation {
                detail: format!("account lookup failed: {e}"),
            })?
            .ok_or(BrokerError::TokenInvalid {
                account_id,
                detail: "unknown account".into(),
            })?;

        if account.deleted || account.requires_reauth {
            return Err(BrokerError::TokenInvalid {
                account_id,
                detail: "account requires re-authorization".into(),
            });
        }
        let refresh_token = account.refresh_token.clone().ok_or(BrokerError::TokenInvalid {
            account_id,
            detail: "no refresh token on file".into(),
        })?;

        match self
            .adapter
            .refresh_token(
                account.environment,
                &account.client_id,
                &account.client_secret,
                &refresh_token,
                account_id,
            )
            .await
        {
            Ok(grant) => {
                self.store
                    .update_account_refresh_token(
                        account_id,
                        &grant.refresh_token,
                        &grant.expires_at.to_rfc3339(),
                    )
                    .await
                    .map_err(|e| BrokerError::InvariantViolation {
                        detail: format!("persisting refreshed token failed: {e}"),
                    })?;

                let token = grant.access_token.clone();
                self.entries.write().insert(
                    account_id,
                    TokenEntry {
                        access_token: grant.access_token,
                        expires_at: grant.expires_at,
                        consecutive_failures: 0,
                        next_attempt_at: Utc::now(),
                    },
                );
                info!(account_id, expires_at = %grant.expires_at, "token renewed");
                Ok(token)
            }
            Err(e @ BrokerError::TokenInvalid { .. }) => {
                error!(account_id, error = %e, "refresh rejected — account requires re-authorization");
                if let Err(db_err) = self.store.set_requires_reauth(account_id).await {
                    error!(account_id, error = %db_err, "failed to persist requires_reauth");
                }
                self.entries.write().remove(&account_id);
                self.bus.log(
                    "error",
                    "tokens",
                    "account requires re-authorization",
                    serde_json::json!({ "account_id": account_id }),
                );
                Err(e)
            }
            Err(e) => {
                let stale = {
                    let mut entries = self.entries.write();
                    if let Some(entry) = entries.get_mut(&account_id) {
                        entry.consecutive_failures += 1;
                        let backoff = (1i64 << (entry.consecutive_failures.min(6) - 1))
                            .min(BACKOFF_CAP_SECONDS);
                        entry.next_attempt_at = Utc::now() + Duration::seconds(backoff);
                        // Stale but not truly expired: still usable.
                        (entry.expires_at > Utc::now()).then(|| entry.access_token.clone())
                    } else {
                        None
                    }
                };

                match stale {
                    Some(token) => {
                        warn!(account_id, error = %e, "renewal failed — using stale token until true expiry");
                        Ok(token)
                    }
                    None => {
                        warn!(account_id, error = %e, "renewal failed with no usable token");
                        Err(e)
                    }
                }
            }
        }
    }

    /// Seed the cache after an OAuth code exchange.
    pub fn insert_grant(&self, account_id: i64, access_token: String, expires_at: DateTime<Utc>) {
        self.entries.write().insert(
            account_id,
            TokenEntry {
                access_token,
                expires_at,
                consecutive_failures: 0,
                next_attempt_at: Utc::now(),
            },
        );
    }

    /// Drop an account's cached token (disconnect, deletion).
    pub fn evict(&self, account_id: i64) {
        self.entries.write().remove(&account_id);
    }

    /// One pass of the refresh-ahead daemon: renew every active account
    /// whose token expires within `ahead`, honouring per-entry backoff.
    pub async fn refresh_ahead_pass(&self, ahead: Duration) {
        let accounts = match self.store.list_active_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "refresh-ahead scan could not list accounts");
                return;
            }
        };

        let now = Utc::now();
        for account in accounts {
            if account.requires_reauth || account.refresh_token.is_none() {
                continue;
            }

            let (expires_at, backoff_until) = {
                let entries = self.entries.read();
                match entries.get(&account.id) {
                    Some(e) => (Some(e.expires_at), Some(e.next_attempt_at)),
                    None => (
                        account
                            .token_expires_at
                            .as_deref()
                            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            .map(|t| t.with_timezone(&Utc)),
                        None,
                    ),
                }
            };

            let due = match expires_at {
                Some(t) => now + ahead >= t,
                // Never seen a token for this account: renew to warm the cache.
                None => true,
            };
            if !due {
                continue;
            }
            if let Some(until) = backoff_until {
                if now < until {
                    debug!(account_id = account.id, "renewal backed off — skipping this pass");
                    continue;
                }
            }

            if let Err(e) = self.renew(account.id).await {
                debug!(account_id = account.id, error = %e, "refresh-ahead renewal failed");
            }
        }
    }

    /// Token health for the status endpoints.
    pub fn health(&self) -> Vec<TokenHealth> {
        let now = Utc::now();
        self.entries
            .read()
            .iter()
            .map(|(id, e)| TokenHealth {
                account_id: *id,
                expires_at: e.expires_at.to_rfc3339(),
                seconds_to_expiry: (e.expires_at - now).num_seconds(),
                consecutive_failures: e.consecutive_failures,
            })
            .collect()
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

/// Background refresh-ahead loop. Spawned once at startup.
pub async fn run_refresh_daemon(
    cache: Arc<TokenCache>,
    scan_interval_seconds: u64,
    refresh_ahead_seconds: u64,
) {
    info!(
        scan_interval_seconds,
        refresh_ahead_seconds, "token refresh daemon started"
    );
    let ahead = Duration::seconds(refresh_ahead_seconds as i64);
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(scan_interval_seconds.max(1)));
    loop {
        ticker.tick().await;
        cache.refresh_ahead_pass(ahead).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::adapter::mock::MockBroker;
    use crate::types::Environment;
    use std::sync::atomic::Ordering;

    async fn cache_with_account(mock: Arc<MockBroker>) -> (Arc<TokenCache>, i64) {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("ops", "x").await.unwrap();
        let account = store
            .insert_account(user, "apex", Environment::Demo, "cid", "secret")
            .await
            .unwrap();
        store
            .update_account_refresh_token(account, "rt-1", &Utc::now().to_rfc3339())
            .await
            .unwrap();
        let cache = Arc::new(TokenCache::new(
            store,
            mock,
            EventBus::new(),
            120,
        ));
        (cache, account)
    }

    #[tokio::test]
    async fn get_renews_when_cache_is_cold() {
        let mock = Arc::new(MockBroker::new());
        let (cache, account) = cache_with_account(mock.clone()).await;

        let token = cache.get(account).await.unwrap();
        assert!(token.starts_with("access-rt-1"));
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);

        // Fresh token: second get is a cache hit.
        let again = cache.get(account).await.unwrap();
        assert_eq!(again, token);
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_gets_issue_exactly_one_refresh() {
        // Two concurrent calls with an expired cache entry produce
        // one refresh request; both proceed with the refreshed token.
        let mut broker = MockBroker::new();
        broker.refresh_delay_ms = 50;
        let mock = Arc::new(broker);
        let (cache, account) = cache_with_account(mock.clone()).await;

        let (a, b) = tokio::join!(cache.get(account), cache.get(account));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(
            mock.refresh_calls.load(Ordering::SeqCst),
            1,
            "renewal must be serialized per account"
        );
    }

    #[tokio::test]
    async fn invalid_grant_marks_account_requires_reauth() {
        let mock = Arc::new(MockBroker::new());
        *mock.fail_refresh_invalid_grant.lock() = true;
        let (cache, account) = cache_with_account(mock.clone()).await;

        let err = cache.get(account).await.unwrap_err();
        assert_eq!(err.kind(), "token_invalid");

        // The account is now flagged and its tokens purged; further gets
        // fail fast without calling the broker again.
        let calls_after_first = mock.refresh_calls.load(Ordering::SeqCst);
        let err = cache.get(account).await.unwrap_err();
        assert_eq!(err.kind(), "token_invalid");
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn transport_failure_keeps_stale_token_until_true_expiry() {
        let mock = Arc::new(MockBroker::new());
        *mock.fail_refresh_timeout.lock() = true;
        let (cache, account) = cache_with_account(mock.clone()).await;

        // Stale (inside the 120 s skew) but not truly expired.
        cache.insert_grant(account, "stale-token".into(), Utc::now() + Duration::seconds(60));

        // get() attempts a renewal, the renewal times out, and the stale
        // token is returned instead.
        let token = cache.get(account).await.unwrap();
        assert_eq!(token, "stale-token");
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);

        let health = cache.health();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn refresh_ahead_pass_renews_expiring_tokens() {
        let mock = Arc::new(MockBroker::new());
        let (cache, account) = cache_with_account(mock.clone()).await;

        // Expires within the 2 h window: the daemon pass renews it.
        cache.insert_grant(account, "old".into(), Utc::now() + Duration::minutes(30));
        cache.refresh_ahead_pass(Duration::hours(2)).await;
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);

        // Now far from expiry (the mock grants ~80 min)... renew once more
        // with a long window to prove the due check, then with a short one
        // to prove the skip.
        cache.refresh_ahead_pass(Duration::minutes(5)).await;
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1, "fresh token skipped");
    }
}
