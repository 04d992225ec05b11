// =============================================================================
// Tradovate REST API Client — bearer-token requests against the demo or
// live environment
// =============================================================================
//
// SECURITY: client secrets and tokens are never logged or serialized. Every
// request carries a per-call timeout; transport failures that provably never
// reached the broker (connection refused, DNS) are retried up to three
// times with jitter, everything else surfaces exactly once as its
// BrokerError kind — an order is never resubmitted.
// =============================================================================

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::broker::adapter::{
    BracketOrderIds, BrokerAdapter, BrokerPosition, OrderRequest, OrderType, PlacedOrder,
    TokenGrant,
};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{Action, Environment};

/// Maximum attempts for provably pre-submit transport failures.
const PRE_SUBMIT_ATTEMPTS: u32 = 3;

/// Tradovate REST client. Stateless and shared; authenticated sessions are
/// owned by the connection pool, which passes the access token per call.
pub struct TradovateClient {
    client: reqwest::Client,
    demo_base: String,
    live_base: String,
    timeout_ms: u64,
}

impl TradovateClient {
    pub fn new(timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();

        debug!(timeout_ms, "TradovateClient initialised");

        Self {
            client,
            demo_base: "https://demo.tradovateapi.com/v1".to_string(),
            live_base: "https://live.tradovateapi.com/v1".to_string(),
            timeout_ms,
        }
    }

    /// Override the base URLs (test servers).
    pub fn with_base_urls(mut self, demo: impl Into<String>, live: impl Into<String>) -> Self {
        self.demo_base = demo.into();
        self.live_base = live.into();
        self
    }

    fn base(&self, environment: Environment) -> &str {
        match environment {
            Environment::Demo => &self.demo_base,
            Environment::Live => &self.live_base,
        }
    }

    // -------------------------------------------------------------------------
    // Error classification
    // -------------------------------------------------------------------------

    fn classify_transport(&self, e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::Timeout {
                timeout_ms: self.timeout_ms,
            }
        } else if e.is_connect() {
            BrokerError::Unreachable {
                detail: e.to_string(),
            }
        } else {
            // The request may have left the socket; treat as a rejection so
            // it is never retried.
            BrokerError::Rejected {
                detail: e.to_string(),
            }
        }
    }

    /// POST a JSON body, retrying only connection-level failures.
    async fn post_json(
        &self,
        environment: Environment,
        access_token: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> BrokerResult<serde_json::Value> {
        let url = format!("{}{}", self.base(environment), path);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) => return Self::read_body(resp).await,
                Err(e) => {
                    let err = self.classify_transport(e);
                    if err.retryable_pre_submit() && attempt < PRE_SUBMIT_ATTEMPTS {
                        let jitter_ms = 50 + (attempt as u64 * 37) % 150;
                        warn!(path, attempt, error = %err, "pre-submit transport failure — retrying");
                        tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn get_json(
        &self,
        environment: Environment,
        access_token: &str,
        path_and_query: &str,
    ) -> BrokerResult<serde_json::Value> {
        let url = format!("{}{}", self.base(environment), path_and_query);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self
                .client
                .get(&url)
                .bearer_auth(access_token)
                .send()
                .await;

            match result {
                Ok(resp) => return Self::read_body(resp).await,
                Err(e) => {
                    let err = self.classify_transport(e);
                    if err.retryable_pre_submit() && attempt < PRE_SUBMIT_ATTEMPTS {
                        let jitter_ms = 50 + (attempt as u64 * 37) % 150;
                        warn!(path = path_and_query, attempt, error = %err, "pre-submit transport failure — retrying");
                        tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn read_body(resp: reqwest::Response) -> BrokerResult<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            return Err(BrokerError::Rejected {
                detail: format!("{status}: {body}"),
            });
        }
        Ok(body)
    }

    /// An order ack that carries a failure reason — or nothing at all — is
    /// a rejection even under HTTP 200.
    fn order_id_from_ack(body: &serde_json::Value) -> BrokerResult<String> {
        if let Some(reason) = body.get("failureReason").and_then(|v| v.as_str()) {
            let text = body
                .get("failureText")
                .and_then(|v| v.as_str())
                .unwrap_or(reason);
            return Err(BrokerError::Rejected {
                detail: text.to_string(),
            });
        }
        body.get("orderId")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .ok_or_else(|| BrokerError::Rejected {
                detail: format!("order ack missing orderId: {body}"),
            })
    }

    fn tradovate_action(action: Action) -> BrokerResult<&'static str> {
        match action {
            Action::Buy => Ok("Buy"),
            Action::Sell => Ok("Sell"),
            Action::Close => Err(BrokerError::InvariantViolation {
                detail: "close is not a broker order action".into(),
            }),
        }
    }

    fn order_body(request: &OrderRequest) -> BrokerResult<serde_json::Value> {
        let action = Self::tradovate_action(request.action)?;
        let mut body = json!({
            "accountId": request.broker_account_id,
            "action": action,
            "symbol": request.contract,
            "orderQty": request.qty,
            "orderType": request.order_type.to_string(),
            "isAutomated": true,
        });
        match request.order_type {
            OrderType::Limit => {
                body["price"] = json!(request.price.map(|p| p.to_string()));
            }
            OrderType::Stop => {
                body["stopPrice"] = json!(request.price.map(|p| p.to_string()));
            }
            OrderType::Market => {}
        }
        if let Some(group) = &request.link_group {
            body["ocoGroup"] = json!(group);
        }
        Ok(body)
    }

    async fn token_request(
        &self,
        environment: Environment,
        form: &[(&str, &str)],
        account_id: Option<i64>,
    ) -> BrokerResult<TokenGrant> {
        let url = format!("{}/auth/oauthtoken", self.base(environment));
        let resp = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);

        let oauth_error = body.get("error").and_then(|v| v.as_str());
        if oauth_error == Some("invalid_grant") {
            return Err(BrokerError::TokenInvalid {
                account_id: account_id.unwrap_or(0),
                detail: "invalid_grant".into(),
            });
        }
        if !status.is_success() {
            return Err(BrokerError::Rejected {
                detail: format!("token endpoint {status}: {body}"),
            });
        }

        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::Rejected {
                detail: format!("token response missing access_token: {body}"),
            })?
            .to_string();
        let refresh_token = body
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let expires_in = body.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(4800);

        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in),
        })
    }
}

#[async_trait]
impl BrokerAdapter for TradovateClient {
    #[instrument(skip(self, client_secret, code), name = "tradovate::exchange_auth_code")]
    async fn exchange_auth_code(
        &self,
        environment: Environment,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> BrokerResult<TokenGrant> {
        self.token_request(
            environment,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ],
            None,
        )
        .await
    }

    #[instrument(skip(self, client_secret, refresh_token), name = "tradovate::refresh_token")]
    async fn refresh_token(
        &self,
        environment: Environment,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        account_id: i64,
    ) -> BrokerResult<TokenGrant> {
        self.token_request(
            environment,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ],
            Some(account_id),
        )
        .await
    }

    #[instrument(skip(self, access_token), name = "tradovate::place_order", fields(contract = %request.contract, qty = request.qty))]
    async fn place_order(
        &self,
        environment: Environment,
        access_token: &str,
        request: &OrderRequest,
    ) -> BrokerResult<PlacedOrder> {
        let body = Self::order_body(request)?;
        let ack = self
            .post_json(environment, access_token, "/order/placeorder", &body)
            .await?;
        let order_id = Self::order_id_from_ack(&ack)?;

        debug!(order_id = %order_id, contract = %request.contract, "order placed");
        Ok(PlacedOrder {
            order_id,
            fill_price: None,
        })
    }

    #[instrument(skip(self, access_token, tp_price, sl_price), name = "tradovate::place_bracket", fields(contract = %parent.contract))]
    async fn place_bracket(
        &self,
        environment: Environment,
        access_token: &str,
        parent: &OrderRequest,
        tp_price: Option<Decimal>,
        sl_price: Option<Decimal>,
    ) -> BrokerResult<BracketOrderIds> {
        let exit_action = Self::tradovate_action(match parent.action {
            Action::Buy => Action::Sell,
            Action::Sell => Action::Buy,
            Action::Close => {
                return Err(BrokerError::InvariantViolation {
                    detail: "close is not a bracket parent action".into(),
                })
            }
        })?;

        let mut body = Self::order_body(parent)?;
        if let Some(tp) = tp_price {
            body["bracket1"] = json!({
                "action": exit_action,
                "orderType": "Limit",
                "price": tp.to_string(),
            });
        }
        if let Some(sl) = sl_price {
            body["bracket2"] = json!({
                "action": exit_action,
                "orderType": "Stop",
                "stopPrice": sl.to_string(),
            });
        }

        let ack = self
            .post_json(environment, access_token, "/order/placeoso", &body)
            .await?;
        let parent_id = Self::order_id_from_ack(&ack)?;

        let tp_order_id = ack
            .get("oso1Id")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string());
        let sl_order_id = ack
            .get("oso2Id")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string());

        debug!(order_id = %parent_id, "bracket order placed");
        Ok(BracketOrderIds {
            parent: PlacedOrder {
                order_id: parent_id,
                fill_price: None,
            },
            tp_order_id,
            sl_order_id,
        })
    }

    fn supports_native_brackets(&self) -> bool {
        true
    }

    #[instrument(skip(self, access_token), name = "tradovate::cancel_order")]
    async fn cancel_order(
        &self,
        environment: Environment,
        access_token: &str,
        order_id: &str,
    ) -> BrokerResult<()> {
        let id: i64 = order_id.parse().map_err(|_| BrokerError::InvariantViolation {
            detail: format!("non-numeric order id '{order_id}'"),
        })?;
        self.post_json(
            environment,
            access_token,
            "/order/cancelorder",
            &json!({ "orderId": id }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, access_token), name = "tradovate::get_quote")]
    async fn get_quote(
        &self,
        environment: Environment,
        access_token: &str,
        contract: &str,
    ) -> BrokerResult<Decimal> {
        let body = self
            .get_json(
                environment,
                access_token,
                &format!("/md/quotes?symbol={contract}"),
            )
            .await?;

        let last = body
            .get("last")
            .or_else(|| body.get("lastPrice"))
            .and_then(|v| v.as_str().map(|s| s.to_string()).or_else(|| v.as_f64().map(|f| f.to_string())));

        last.and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| BrokerError::Rejected {
                detail: format!("quote response missing last price: {body}"),
            })
    }

    #[instrument(skip(self), name = "tradovate::resolve_symbol")]
    async fn resolve_symbol(
        &self,
        environment: Environment,
        root: &str,
    ) -> BrokerResult<String> {
        // Contract discovery is public metadata; no bearer token needed.
        let body = self
            .get_json(environment, "", &format!("/contract/suggest?t={root}&l=5"))
            .await?;

        body.as_array()
            .and_then(|arr| {
                arr.iter().find_map(|c| {
                    c.get("name")
                        .and_then(|n| n.as_str())
                        .filter(|n| n.starts_with(root))
                        .map(|n| n.to_string())
                })
            })
            .ok_or_else(|| BrokerError::Rejected {
                detail: format!("no contract found for root {root}"),
            })
    }

    #[instrument(skip(self, access_token), name = "tradovate::get_positions")]
    async fn get_positions(
        &self,
        environment: Environment,
        access_token: &str,
        broker_account_id: i64,
    ) -> BrokerResult<Vec<BrokerPosition>> {
        let body = self
            .get_json(environment, access_token, "/position/list")
            .await?;

        let items = body.as_array().cloned().unwrap_or_default();
        let mut positions = Vec::new();
        for item in items {
            let account = item.get("accountId").and_then(|v| v.as_i64()).unwrap_or(0);
            if account != broker_account_id {
                continue;
            }
            let net_qty = item.get("netPos").and_then(|v| v.as_i64()).unwrap_or(0);
            if net_qty == 0 {
                continue;
            }
            let contract = item
                .get("symbol")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let avg_price = item
                .get("netPrice")
                .and_then(|v| v.as_f64())
                .map(|f| f.to_string())
                .and_then(|s| s.parse::<Decimal>().ok())
                .unwrap_or(Decimal::ZERO);
            positions.push(BrokerPosition {
                contract,
                net_qty,
                avg_price,
            });
        }

        debug!(count = positions.len(), broker_account_id, "positions fetched");
        Ok(positions)
    }

    #[instrument(skip(self, access_token), name = "tradovate::ping")]
    async fn ping(&self, environment: Environment, access_token: &str) -> BrokerResult<()> {
        self.get_json(environment, access_token, "/auth/me").await?;
        Ok(())
    }
}

impl std::fmt::Debug for TradovateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradovateClient")
            .field("demo_base", &self.demo_base)
            .field("live_base", &self.live_base)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}
