// =============================================================================
// Connection Pool — one long-lived authenticated session per subaccount
// =============================================================================
//
// Sessions are created lazily on first use and re-used for every subsequent
// order. A keep-alive daemon pings each session; a failed ping closes and
// removes the entry, which is lazily re-created on next use. In-flight
// orders are never cancelled by pool maintenance — only the session handle
// is recycled.
//
// Lock discipline: one creation lock per subaccount; reads after the entry
// exists take the shared map lock only.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::adapter::BrokerAdapter;
use crate::error::{BrokerError, BrokerResult};
use crate::store::Store;
use crate::tokens::TokenCache;
use crate::types::Environment;

/// One pooled authenticated session. The access token is read through the
/// token cache on every use so mid-session renewals are picked up without
/// recycling the handle.
pub struct SubaccountSession {
    pub subaccount_id: i64,
    pub account_id: i64,
    pub broker_account_id: i64,
    pub environment: Environment,
    tokens: Arc<TokenCache>,
    created_at: Instant,
    last_ping_ok: RwLock<Option<DateTime<Utc>>>,
}

impl SubaccountSession {
    /// Current access token for this session's account.
    pub async fn access_token(&self) -> BrokerResult<String> {
        self.tokens.get(self.account_id).await
    }

    pub fn age_seconds(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

impl std::fmt::Debug for SubaccountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubaccountSession")
            .field("subaccount_id", &self.subaccount_id)
            .field("account_id", &self.account_id)
            .field("environment", &self.environment)
            .finish()
    }
}

/// Per-session health line for the websocket-status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub subaccount_id: i64,
    pub account_id: i64,
    pub environment: Environment,
    pub age_seconds: u64,
    pub last_ping_ok: Option<String>,
}

/// Keyed pool of subaccount sessions.
pub struct ConnectionPool {
    store: Store,
    tokens: Arc<TokenCache>,
    adapter: Arc<dyn BrokerAdapter>,
    sessions: RwLock<HashMap<i64, Arc<SubaccountSession>>>,
    create_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionPool {
    pub fn new(store: Store, tokens: Arc<TokenCache>, adapter: Arc<dyn BrokerAdapter>) -> Self {
        Self {
            store,
            tokens,
            adapter,
            sessions: RwLock::new(HashMap::new()),
            create_locks: Mutex::new(HashMap::new()),
        }
    }

    fn create_lock(&self, subaccount_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.create_locks.lock();
        locks
            .entry(subaccount_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Existing session for the subaccount, or create and authenticate one.
    pub async fn session(&self, subaccount_id: i64) -> BrokerResult<Arc<SubaccountSession>> {
        if let Some(existing) = self.sessions.read().get(&subaccount_id) {
            return Ok(existing.clone());
        }

        let lock = self.create_lock(subaccount_id);
        let _guard = lock.lock().await;

        // Another creator may have won the race while we waited.
        if let Some(existing) = self.sessions.read().get(&subaccount_id) {
            return Ok(existing.clone());
        }

        let subaccount = self
            .store
            .get_subaccount(subaccount_id)
            .await
            .map_err(|e| BrokerError::InvariantViolation {
                detail: format!("subaccount lookup failed: {e}"),
            })?
            .ok_or(BrokerError::InvariantViolation {
                detail: format!("unknown subaccount {subaccount_id}"),
            })?;

        let account = self
            .store
            .get_account(subaccount.account_id)
            .await
            .map_err(|e| BrokerError::InvariantViolation {
                detail: format!("account lookup failed: {e}"),
            })?
            .ok_or(BrokerError::InvariantViolation {
                detail: format!("unknown account {}", subaccount.account_id),
            })?;

        if account.deleted {
            return Err(BrokerError::TokenInvalid {
                account_id: account.id,
                detail: "account disconnected".into(),
            });
        }

        // Authenticate up front so a broken account fails here, not on the
        // first order.
        self.tokens.get(account.id).await?;

        let session = Arc::new(SubaccountSession {
            subaccount_id,
            account_id: account.id,
            broker_account_id: subaccount.broker_account_id,
            environment: account.environment,
            tokens: self.tokens.clone(),
            created_at: Instant::now(),
            last_ping_ok: RwLock::new(None),
        });

        info!(
            subaccount_id,
            account_id = account.id,
            environment = %account.environment,
            "subaccount session created"
        );
        self.sessions.write().insert(subaccount_id, session.clone());
        Ok(session)
    }

    /// Drop one session. The next use re-creates it.
    pub fn remove(&self, subaccount_id: i64) {
        if self.sessions.write().remove(&subaccount_id).is_some() {
            debug!(subaccount_id, "subaccount session removed");
        }
    }

    /// Drop every session belonging to an account (disconnect path) and
    /// evict its cached token.
    pub fn remove_for_account(&self, account_id: i64) {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.account_id != account_id);
        let removed = before - sessions.len();
        drop(sessions);
        self.tokens.evict(account_id);
        if removed > 0 {
            info!(account_id, removed, "sessions closed for disconnected account");
        }
    }

    /// Close every session (shutdown).
    pub fn clear(&self) {
        let n = {
            let mut sessions = self.sessions.write();
            let n = sessions.len();
            sessions.clear();
            n
        };
        if n > 0 {
            info!(count = n, "all pooled sessions closed");
        }
    }

    pub fn size(&self) -> usize {
        self.sessions.read().len()
    }

    /// One keep-alive pass: ping every session; close the ones that fail.
    pub async fn keepalive_pass(&self) {
        let sessions: Vec<Arc<SubaccountSession>> =
            self.sessions.read().values().cloned().collect();

        for session in sessions {
            let token = match session.access_token().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        subaccount_id = session.subaccount_id,
                        error = %e,
                        "keep-alive could not obtain token — closing session"
                    );
                    self.remove(session.subaccount_id);
                    continue;
                }
            };

            match self.adapter.ping(session.environment, &token).await {
                Ok(()) => {
                    *session.last_ping_ok.write() = Some(Utc::now());
                }
                Err(e) => {
                    warn!(
                        subaccount_id = session.subaccount_id,
                        error = %e,
                        "keep-alive ping failed — closing session for lazy re-create"
                    );
                    self.remove(session.subaccount_id);
                }
            }
        }
    }

    /// Per-session health for the status endpoint.
    pub fn health(&self) -> Vec<SessionHealth> {
        self.sessions
            .read()
            .values()
            .map(|s| SessionHealth {
                subaccount_id: s.subaccount_id,
                account_id: s.account_id,
                environment: s.environment,
                age_seconds: s.age_seconds(),
                last_ping_ok: s.last_ping_ok.read().map(|t| t.to_rfc3339()),
            })
            .collect()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("sessions", &self.size())
            .finish()
    }
}

/// Background keep-alive loop. Spawned once at startup.
pub async fn run_keepalive_daemon(pool: Arc<ConnectionPool>, interval_seconds: u64) {
    info!(interval_seconds, "keep-alive daemon started");
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
    loop {
        ticker.tick().await;
        pool.keepalive_pass().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::adapter::mock::MockBroker;
    use crate::events::EventBus;
    use std::sync::atomic::Ordering;

    async fn pool_with_subaccount() -> (Arc<ConnectionPool>, Arc<MockBroker>, i64, i64) {
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
        let sub = store.insert_subaccount(account, 77001, "APEX-1").await.unwrap();

        let mock = Arc::new(MockBroker::new());
        let tokens = Arc::new(TokenCache::new(
            store.clone(),
            mock.clone(),
            EventBus::new(),
            120,
        ));
        let pool = Arc::new(ConnectionPool::new(store, tokens, mock.clone()));
        (pool, mock, sub, account)
    }

    #[tokio::test]
    async fn first_use_creates_then_reuses() {
        let (pool, mock, sub, _account) = pool_with_subaccount().await;

        let a = pool.session(sub).await.unwrap();
        assert_eq!(a.broker_account_id, 77001);
        assert_eq!(pool.size(), 1);

        let b = pool.session(sub).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b), "second use must return the pooled handle");
        // Authentication happened once, at creation.
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_one_session() {
        let (pool, _mock, sub, _account) = pool_with_subaccount().await;
        let (a, b) = tokio::join!(pool.session(sub), pool.session(sub));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn keepalive_marks_healthy_sessions() {
        let (pool, _mock, sub, _account) = pool_with_subaccount().await;
        pool.session(sub).await.unwrap();

        pool.keepalive_pass().await;
        let health = pool.health();
        assert_eq!(health.len(), 1);
        assert!(health[0].last_ping_ok.is_some());
    }

    #[tokio::test]
    async fn disconnect_closes_account_sessions() {
        let (pool, _mock, sub, account) = pool_with_subaccount().await;
        pool.session(sub).await.unwrap();
        assert_eq!(pool.size(), 1);

        pool.remove_for_account(account);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn unknown_subaccount_is_invariant_violation() {
        let (pool, _mock, _sub, _account) = pool_with_subaccount().await;
        let err = pool.session(999).await.unwrap_err();
        assert_eq!(err.kind(), "invariant_violation");
    }
}
