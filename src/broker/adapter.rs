// =============================================================================
// Broker Adapter — abstract contract the execution path is written against
// =============================================================================
//
// One implementation talks to Tradovate (see tradovate.rs); tests use the
// scriptable mock at the bottom of this file. Every operation returns the
// closed BrokerError kind set; nothing here retries an order — transport
// retries for provably pre-submit failures live inside the implementation.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::BrokerResult;
use crate::types::{Action, Environment};

/// Order flavour for the parent and bracket children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "Market"),
            Self::Limit => write!(f, "Limit"),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

/// One order to submit.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    /// The broker's own account id for the target subaccount.
    pub broker_account_id: i64,
    /// Resolved contract code (e.g. "MNQM6").
    pub contract: String,
    pub action: Action,
    pub qty: i64,
    pub order_type: OrderType,
    /// Limit or stop price; None for market orders.
    pub price: Option<Decimal>,
    /// OCO link group, where the broker supports linked children.
    pub link_group: Option<String>,
}

/// Broker acknowledgement of a single order.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
    /// Fill price when the broker reports it synchronously.
    pub fill_price: Option<Decimal>,
}

/// Acknowledgement of a parent plus linked bracket children.
#[derive(Debug, Clone)]
pub struct BracketOrderIds {
    pub parent: PlacedOrder,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
}

/// Net position as the broker reports it. Consumed only by the
/// reconciliation audit, never by the position tracker.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerPosition {
    pub contract: String,
    pub net_qty: i64,
    pub avg_price: Decimal,
}

/// Result of an OAuth code exchange or refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Abstract broker operations. One persistent authenticated session exists
/// per subaccount (owned by the connection pool); the adapter itself is
/// stateless and shared.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Exchange an OAuth authorization code for tokens.
    async fn exchange_auth_code(
        &self,
        environment: Environment,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> BrokerResult<TokenGrant>;

    /// Exchange a refresh token for a fresh grant.
    async fn refresh_token(
        &self,
        environment: Environment,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        account_id: i64,
    ) -> BrokerResult<TokenGrant>;

    /// Submit one order.
    async fn place_order(
        &self,
        environment: Environment,
        access_token: &str,
        request: &OrderRequest,
    ) -> BrokerResult<PlacedOrder>;

    /// Submit a market parent with linked TP/SL children in one call
    /// (order-sends-order). Only meaningful when
    /// [`supports_native_brackets`](Self::supports_native_brackets) is true.
    async fn place_bracket(
        &self,
        environment: Environment,
        access_token: &str,
        parent: &OrderRequest,
        tp_price: Option<Decimal>,
        sl_price: Option<Decimal>,
    ) -> BrokerResult<BracketOrderIds>;

    /// Whether the broker links bracket children natively (OCO/OSO). When
    /// false the workers enroll children in the local bracket watcher.
    fn supports_native_brackets(&self) -> bool;

    async fn cancel_order(
        &self,
        environment: Environment,
        access_token: &str,
        order_id: &str,
    ) -> BrokerResult<()>;

    /// Last traded price for a contract.
    async fn get_quote(
        &self,
        environment: Environment,
        access_token: &str,
        contract: &str,
    ) -> BrokerResult<Decimal>;

    /// Resolve a ticker root (e.g. "MNQ") to the tradable front contract.
    async fn resolve_symbol(
        &self,
        environment: Environment,
        root: &str,
    ) -> BrokerResult<String>;

    /// Net positions for a subaccount. Reconciliation audit only.
    async fn get_positions(
        &self,
        environment: Environment,
        access_token: &str,
        broker_account_id: i64,
    ) -> BrokerResult<Vec<BrokerPosition>>;

    /// Cheap liveness probe for the keep-alive daemon.
    async fn ping(&self, environment: Environment, access_token: &str) -> BrokerResult<()>;
}

// =============================================================================
// Scriptable mock for tests
// =============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::error::BrokerError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Mock adapter whose behaviour is scripted per test. Records every
    /// placed order so tests can assert exact attempt counts (no retries,
    /// no drops).
    pub struct MockBroker {
        pub placed: Mutex<Vec<OrderRequest>>,
        pub reject_orders: Mutex<bool>,
        pub timeout_orders: Mutex<bool>,
        pub refresh_calls: AtomicU64,
        pub fail_refresh_invalid_grant: Mutex<bool>,
        pub fail_refresh_timeout: Mutex<bool>,
        pub quote: Mutex<Option<Decimal>>,
        order_seq: AtomicU64,
        pub native_brackets: bool,
        /// Delay inside refresh_token, to widen contention windows in tests.
        pub refresh_delay_ms: u64,
    }

    impl MockBroker {
        pub fn new() -> Self {
            Self {
                placed: Mutex::new(Vec::new()),
                reject_orders: Mutex::new(false),
                timeout_orders: Mutex::new(false),
                refresh_calls: AtomicU64::new(0),
                fail_refresh_invalid_grant: Mutex::new(false),
                fail_refresh_timeout: Mutex::new(false),
                quote: Mutex::new(None),
                order_seq: AtomicU64::new(9000),
                native_brackets: true,
                refresh_delay_ms: 0,
            }
        }

        pub fn placed_count(&self) -> usize {
            self.placed.lock().len()
        }

        fn next_order_id(&self) -> String {
            self.order_seq.fetch_add(1, Ordering::SeqCst).to_string()
        }

        fn order_gate(&self) -> BrokerResult<()> {
            if *self.timeout_orders.lock() {
                return Err(BrokerError::Timeout { timeout_ms: 10_000 });
            }
            if *self.reject_orders.lock() {
                return Err(BrokerError::Rejected {
                    detail: "Insufficient margin".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BrokerAdapter for MockBroker {
        async fn exchange_auth_code(
            &self,
            _environment: Environment,
            _client_id: &str,
            _client_secret: &str,
            code: &str,
            _redirect_uri: &str,
        ) -> BrokerResult<TokenGrant> {
            Ok(TokenGrant {
                access_token: format!("access-{code}"),
                refresh_token: format!("refresh-{code}"),
                expires_at: Utc::now() + chrono::Duration::minutes(80),
            })
        }

        async fn refresh_token(
            &self,
            _environment: Environment,
            _client_id: &str,
            _client_secret: &str,
            refresh_token: &str,
            account_id: i64,
        ) -> BrokerResult<TokenGrant> {
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.refresh_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.refresh_delay_ms)).await;
            }
            if *self.fail_refresh_invalid_grant.lock() {
                return Err(BrokerError::TokenInvalid {
                    account_id,
                    detail: "invalid_grant".into(),
                });
            }
            if *self.fail_refresh_timeout.lock() {
                return Err(BrokerError::Timeout { timeout_ms: 10_000 });
            }
            Ok(TokenGrant {
                access_token: format!("access-{refresh_token}-{n}"),
                refresh_token: refresh_token.to_string(),
                expires_at: Utc::now() + chrono::Duration::minutes(80),
            })
        }

        async fn place_order(
            &self,
            _environment: Environment,
            _access_token: &str,
            request: &OrderRequest,
        ) -> BrokerResult<PlacedOrder> {
            self.order_gate()?;
            self.placed.lock().push(request.clone());
            Ok(PlacedOrder {
                order_id: self.next_order_id(),
                fill_price: request.price,
            })
        }

        async fn place_bracket(
            &self,
            _environment: Environment,
            _access_token: &str,
            parent: &OrderRequest,
            tp_price: Option<Decimal>,
            sl_price: Option<Decimal>,
        ) -> BrokerResult<BracketOrderIds> {
            self.order_gate()?;
            self.placed.lock().push(parent.clone());
            Ok(BracketOrderIds {
                parent: PlacedOrder {
                    order_id: self.next_order_id(),
                    fill_price: parent.price,
                },
                tp_order_id: tp_price.map(|_| self.next_order_id()),
                sl_order_id: sl_price.map(|_| self.next_order_id()),
            })
        }

        fn supports_native_brackets(&self) -> bool {
            self.native_brackets
        }

        async fn cancel_order(
            &self,
            _environment: Environment,
            _access_token: &str,
            _order_id: &str,
        ) -> BrokerResult<()> {
            Ok(())
        }

        async fn get_quote(
            &self,
            _environment: Environment,
            _access_token: &str,
            _contract: &str,
        ) -> BrokerResult<Decimal> {
            self.quote.lock().ok_or(BrokerError::Unreachable {
                detail: "no quote scripted".into(),
            })
        }

        async fn resolve_symbol(
            &self,
            _environment: Environment,
            root: &str,
        ) -> BrokerResult<String> {
            Ok(format!("{root}M6"))
        }

        async fn get_positions(
            &self,
            _environment: Environment,
            _access_token: &str,
            _broker_account_id: i64,
        ) -> BrokerResult<Vec<BrokerPosition>> {
            Ok(Vec::new())
        }

        async fn ping(&self, _environment: Environment, _access_token: &str) -> BrokerResult<()> {
            Ok(())
        }
    }
}
