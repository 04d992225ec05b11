// =============================================================================
// Signal Store — SQLite persistence for accounts, recorders, signals,
// positions, and trades
// =============================================================================
//
// The signal log is append-only; position rows are derived from it and are
// the engine's authoritative state (the broker is never consulted to decide
// what a position is). Each signal's effect — append to the log plus the
// position mutation — commits in a single transaction.
//
// Money and price columns are TEXT holding canonical Decimal strings;
// quantities are INTEGER. A partial unique index enforces at most one open
// position per (recorder, ticker).
// =============================================================================

use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::filters::FilterConfig;
use crate::types::{BracketSpec, Environment, Side};

// ---------------------------------------------------------------------------
// Row models
// ---------------------------------------------------------------------------

/// One broker account (OAuth client + refresh token + subaccounts).
#[derive(Debug, Clone, Serialize)]
pub struct AccountRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub environment: Environment,
    #[serde(skip_serializing)]
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<String>,
    pub requires_reauth: bool,
    pub deleted: bool,
}

/// A logical trading book inside a broker account.
#[derive(Debug, Clone, Serialize)]
pub struct SubaccountRow {
    pub id: i64,
    pub account_id: i64,
    /// The broker's own account id for order routing.
    pub broker_account_id: i64,
    pub name: String,
}

/// A named signal source keyed by an opaque webhook token.
#[derive(Debug, Clone, Serialize)]
pub struct RecorderRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub webhook_token: String,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub symbol: String,
    pub enabled: bool,
    pub initial_size: i64,
    pub add_size: i64,
    pub reverse_on_opposite: bool,
    pub filters: FilterConfig,
    pub bracket: BracketSpec,
    pub created_at: String,
}

/// A (recorder → subaccount) link with an independent size multiplier.
#[derive(Debug, Clone, Serialize)]
pub struct TraderRow {
    pub id: i64,
    pub recorder_id: i64,
    pub subaccount_id: i64,
    pub multiplier: Decimal,
    pub enabled: bool,
    pub bracket_override: Option<BracketSpec>,
    pub max_contracts_override: Option<i64>,
}

/// Joined view the dispatcher fans out over: trader plus the routing info
/// needed to obtain a broker session.
#[derive(Debug, Clone)]
pub struct TraderTarget {
    pub trader_id: i64,
    pub subaccount_id: i64,
    pub broker_account_id: i64,
    pub account_id: i64,
    pub environment: Environment,
    pub multiplier: Decimal,
    pub bracket_override: Option<BracketSpec>,
    pub max_contracts_override: Option<i64>,
}

/// Immutable record of one accepted webhook.
#[derive(Debug, Clone, Serialize)]
pub struct SignalRow {
    pub id: String,
    pub recorder_id: i64,
    /// Process-wide monotonic acceptance sequence.
    pub seq: i64,
    pub received_at: String,
    pub action: String,
    pub ticker: String,
    pub price: Decimal,
    pub raw_payload: String,
    pub dedup_key: String,
}

/// The engine's authoritative position for (recorder, ticker).
#[derive(Debug, Clone, Serialize)]
pub struct PositionRow {
    pub id: String,
    pub recorder_id: i64,
    pub ticker: String,
    pub side: Side,
    pub total_quantity: i64,
    pub avg_entry_price: Decimal,
    pub current_price: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    pub worst_unrealized_pnl: Decimal,
    pub best_unrealized_pnl: Decimal,
    /// Instrument point value captured at open (1.0 when the root was
    /// unknown).
    pub point_value: Decimal,
    pub status: PositionStatus,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "closed" => Self::Closed,
            _ => Self::Open,
        }
    }
}

/// One executed child of a signal at one trader.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRow {
    pub id: String,
    pub correlation_id: String,
    pub trader_id: i64,
    pub signal_id: String,
    pub symbol: String,
    pub contract: String,
    pub side: String,
    pub quantity: i64,
    pub requested_price: Option<Decimal>,
    pub fill_price: Option<Decimal>,
    pub broker_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub status: TradeStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Placed,
    Filled,
    Rejected,
    Cancelled,
}

impl TradeStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Placed => "placed",
            Self::Filled => "filled",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "filled" => Self::Filled,
            "rejected" => Self::Rejected,
            "cancelled" => Self::Cancelled,
            _ => Self::Placed,
        }
    }
}

/// The position mutation that commits alongside a signal append.
#[derive(Debug, Clone)]
pub enum PositionChange {
    /// CLOSE against FLAT: log the signal, touch nothing.
    None,
    /// OPEN a fresh position row.
    Open(PositionRow),
    /// ADD to the open row: new totals after the weighted average.
    Add {
        id: String,
        total_quantity: i64,
        avg_entry_price: Decimal,
    },
    /// CLOSE the open row.
    Close {
        id: String,
        exit_price: Decimal,
        realized_pnl: Decimal,
        closed_at: String,
    },
    /// FLIP: close the open row, then open the reverse row.
    CloseAndOpen {
        close_id: String,
        exit_price: Decimal,
        realized_pnl: Decimal,
        closed_at: String,
        open: PositionRow,
    },
}

/// Minimal token-resolution entry for the webhook edge.
#[derive(Debug, Clone)]
pub struct WebhookTokenEntry {
    pub recorder_id: i64,
    pub token: String,
    pub secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Decimal <-> TEXT helpers
// ---------------------------------------------------------------------------

fn dec_text(d: Decimal) -> String {
    d.normalize().to_string()
}

fn dec_parse(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("invalid decimal column value '{s}'"))
}

fn dec_opt(s: Option<String>) -> Result<Option<Decimal>> {
    s.map(|v| dec_parse(&v)).transpose()
}

/// Generate a 128-bit URL-safe webhook token.
pub fn generate_webhook_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Thread-safe SQLite store. The single connection serialises all access;
/// callers needing read-modify-write atomicity across awaits additionally
/// hold the per-(recorder, ticker) lock owned by the position tracker.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    signal_seq: Arc<AtomicI64>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db at {db_path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::bootstrap(&conn)?;
        let seq = Self::load_signal_seq(&conn)?;
        info!(db_path, next_seq = seq + 1, "signal store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            signal_seq: Arc::new(AtomicI64::new(seq)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::bootstrap(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            signal_seq: Arc::new(AtomicI64::new(0)),
        })
    }

    fn bootstrap(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                environment TEXT NOT NULL DEFAULT 'demo',
                client_id TEXT NOT NULL,
                client_secret TEXT NOT NULL,
                refresh_token TEXT,
                token_expires_at TEXT,
                requires_reauth INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS subaccounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                broker_account_id INTEGER NOT NULL,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recorders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                webhook_token TEXT NOT NULL UNIQUE,
                webhook_secret TEXT,
                symbol TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                initial_size INTEGER NOT NULL DEFAULT 1,
                add_size INTEGER NOT NULL DEFAULT 1,
                reverse_on_opposite INTEGER NOT NULL DEFAULT 0,
                filter_config TEXT NOT NULL DEFAULT '{}',
                bracket TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS traders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorder_id INTEGER NOT NULL REFERENCES recorders(id) ON DELETE CASCADE,
                subaccount_id INTEGER NOT NULL REFERENCES subaccounts(id),
                multiplier TEXT NOT NULL DEFAULT '1',
                enabled INTEGER NOT NULL DEFAULT 1,
                bracket_override TEXT,
                max_contracts_override INTEGER
            );
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                recorder_id INTEGER NOT NULL REFERENCES recorders(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                received_at TEXT NOT NULL,
                action TEXT NOT NULL,
                ticker TEXT NOT NULL,
                price TEXT NOT NULL,
                raw_payload TEXT NOT NULL,
                dedup_key TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signals_recorder_seq
                ON signals(recorder_id, seq);
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                recorder_id INTEGER NOT NULL REFERENCES recorders(id) ON DELETE CASCADE,
                ticker TEXT NOT NULL,
                side TEXT NOT NULL,
                total_quantity INTEGER NOT NULL,
                avg_entry_price TEXT NOT NULL,
                current_price TEXT,
                unrealized_pnl TEXT NOT NULL DEFAULT '0',
                worst_unrealized_pnl TEXT NOT NULL DEFAULT '0',
                best_unrealized_pnl TEXT NOT NULL DEFAULT '0',
                point_value TEXT NOT NULL DEFAULT '1',
                status TEXT NOT NULL DEFAULT 'open',
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                exit_price TEXT,
                realized_pnl TEXT NOT NULL DEFAULT '0'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_one_open
                ON positions(recorder_id, ticker) WHERE status = 'open';
            CREATE INDEX IF NOT EXISTS idx_positions_recorder_closed
                ON positions(recorder_id, closed_at DESC);
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                correlation_id TEXT NOT NULL,
                trader_id INTEGER NOT NULL REFERENCES traders(id),
                signal_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                contract TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                requested_price TEXT,
                fill_price TEXT,
                broker_order_id TEXT,
                tp_order_id TEXT,
                sl_order_id TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_correlation
                ON trades(correlation_id);",
        )
        .context("bootstrap store schema")?;
        Ok(())
    }

    fn load_signal_seq(conn: &Connection) -> Result<i64> {
        let max: Option<i64> = conn
            .query_row("SELECT MAX(seq) FROM signals", [], |r| r.get(0))
            .context("load max signal seq")?;
        Ok(max.unwrap_or(0))
    }

    /// Next value of the process-wide monotonic acceptance sequence.
    pub fn next_signal_seq(&self) -> i64 {
        self.signal_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
            params![username, password_hash, Utc::now().to_rfc3339()],
        )
        .context("insert user")?;
        Ok(conn.last_insert_rowid())
    }

    // -------------------------------------------------------------------------
    // Accounts
    // -------------------------------------------------------------------------

    pub async fn insert_account(
        &self,
        user_id: i64,
        name: &str,
        environment: Environment,
        client_id: &str,
        client_secret: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO accounts (user_id, name, environment, client_id, client_secret, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                name,
                environment.to_string(),
                client_id,
                client_secret,
                Utc::now().to_rfc3339()
            ],
        )
        .context("insert account")?;
        Ok(conn.last_insert_rowid())
    }

    fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
        let env: String = row.get("environment")?;
        Ok(AccountRow {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            environment: if env == "live" {
                Environment::Live
            } else {
                Environment::Demo
            },
            client_id: row.get("client_id")?,
            client_secret: row.get("client_secret")?,
            refresh_token: row.get("refresh_token")?,
            token_expires_at: row.get("token_expires_at")?,
            requires_reauth: row.get::<_, i64>("requires_reauth")? != 0,
            deleted: row.get::<_, i64>("deleted")? != 0,
        })
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<AccountRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM accounts WHERE id = ?1",
            params![id],
            Self::account_from_row,
        )
        .optional()
        .context("get account")
    }

    pub async fn list_active_accounts(&self) -> Result<Vec<AccountRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM accounts WHERE deleted = 0")?;
        let rows = stmt
            .query_map([], Self::account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list active accounts")?;
        Ok(rows)
    }

    pub async fn update_account_refresh_token(
        &self,
        id: i64,
        refresh_token: &str,
        token_expires_at: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET refresh_token = ?2, token_expires_at = ?3, requires_reauth = 0
             WHERE id = ?1",
            params![id, refresh_token, token_expires_at],
        )
        .context("update account refresh token")?;
        Ok(())
    }

    pub async fn set_requires_reauth(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET requires_reauth = 1, refresh_token = NULL, token_expires_at = NULL
             WHERE id = ?1",
            params![id],
        )
        .context("set requires_reauth")?;
        Ok(())
    }

    /// Soft-delete: the account row survives for history but is excluded
    /// from every active lookup and its tokens are purged.
    pub async fn soft_delete_account(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET deleted = 1, refresh_token = NULL, token_expires_at = NULL
             WHERE id = ?1",
            params![id],
        )
        .context("soft delete account")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Subaccounts
    // -------------------------------------------------------------------------

    pub async fn insert_subaccount(
        &self,
        account_id: i64,
        broker_account_id: i64,
        name: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO subaccounts (account_id, broker_account_id, name) VALUES (?1, ?2, ?3)",
            params![account_id, broker_account_id, name],
        )
        .context("insert subaccount")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_subaccount(&self, id: i64) -> Result<Option<SubaccountRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, account_id, broker_account_id, name FROM subaccounts WHERE id = ?1",
            params![id],
            |row| {
                Ok(SubaccountRow {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    broker_account_id: row.get(2)?,
                    name: row.get(3)?,
                })
            },
        )
        .optional()
        .context("get subaccount")
    }

    pub async fn list_subaccounts(&self, account_id: i64) -> Result<Vec<SubaccountRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, broker_account_id, name FROM subaccounts
             WHERE account_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![account_id], |row| {
                Ok(SubaccountRow {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    broker_account_id: row.get(2)?,
                    name: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list subaccounts")?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Recorders
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_recorder(
        &self,
        user_id: i64,
        name: &str,
        symbol: &str,
        initial_size: i64,
        add_size: i64,
        reverse_on_opposite: bool,
        filters: &FilterConfig,
        bracket: &BracketSpec,
        webhook_secret: Option<&str>,
    ) -> Result<RecorderRow> {
        let token = generate_webhook_token();
        let now = Utc::now().to_rfc3339();
        let filters_json = serde_json::to_string(filters)?;
        let bracket_json = serde_json::to_string(bracket)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO recorders
                (user_id, name, webhook_token, webhook_secret, symbol, enabled,
                 initial_size, add_size, reverse_on_opposite, filter_config, bracket, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                user_id,
                name,
                token,
                webhook_secret,
                symbol,
                initial_size,
                add_size,
                reverse_on_opposite as i64,
                filters_json,
                bracket_json,
                now
            ],
        )
        .context("insert recorder")?;
        let id = conn.last_insert_rowid();
        Ok(RecorderRow {
            id,
            user_id,
            name: name.to_string(),
            webhook_token: token,
            webhook_secret: webhook_secret.map(|s| s.to_string()),
            symbol: symbol.to_string(),
            enabled: true,
            initial_size,
            add_size,
            reverse_on_opposite,
            filters: filters.clone(),
            bracket: bracket.clone(),
            created_at: now,
        })
    }

    fn recorder_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecorderRow> {
        let filters_json: String = row.get("filter_config")?;
        let bracket_json: String = row.get("bracket")?;
        Ok(RecorderRow {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            webhook_token: row.get("webhook_token")?,
            webhook_secret: row.get("webhook_secret")?,
            symbol: row.get("symbol")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            initial_size: row.get("initial_size")?,
            add_size: row.get("add_size")?,
            reverse_on_opposite: row.get::<_, i64>("reverse_on_opposite")? != 0,
            filters: serde_json::from_str(&filters_json).unwrap_or_default(),
            bracket: serde_json::from_str(&bracket_json).unwrap_or_default(),
            created_at: row.get("created_at")?,
        })
    }

    pub async fn get_recorder(&self, id: i64) -> Result<Option<RecorderRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM recorders WHERE id = ?1",
            params![id],
            Self::recorder_from_row,
        )
        .optional()
        .context("get recorder")
    }

    pub async fn list_recorders(&self) -> Result<Vec<RecorderRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM recorders ORDER BY id")?;
        let rows = stmt
            .query_map([], Self::recorder_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list recorders")?;
        Ok(rows)
    }

    /// All (recorder, token, secret) triples for constant-time token
    /// resolution at the webhook edge.
    pub async fn webhook_token_entries(&self) -> Result<Vec<WebhookTokenEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, webhook_token, webhook_secret FROM recorders")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WebhookTokenEntry {
                    recorder_id: row.get(0)?,
                    token: row.get(1)?,
                    secret: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list webhook tokens")?;
        Ok(rows)
    }

    pub async fn set_recorder_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE recorders SET enabled = ?2 WHERE id = ?1",
                params![id, enabled as i64],
            )
            .context("set recorder enabled")?;
        Ok(n > 0)
    }

    /// Rotate the webhook token. The old mapping is gone the moment this
    /// commits; in-flight uses of the old token resolve to nothing.
    pub async fn rotate_webhook_token(&self, id: i64) -> Result<Option<String>> {
        let token = generate_webhook_token();
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE recorders SET webhook_token = ?2 WHERE id = ?1",
                params![id, token],
            )
            .context("rotate webhook token")?;
        Ok((n > 0).then_some(token))
    }

    // -------------------------------------------------------------------------
    // Traders
    // -------------------------------------------------------------------------

    pub async fn insert_trader(
        &self,
        recorder_id: i64,
        subaccount_id: i64,
        multiplier: Decimal,
        bracket_override: Option<&BracketSpec>,
        max_contracts_override: Option<i64>,
    ) -> Result<i64> {
        let bracket_json = bracket_override
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO traders
                (recorder_id, subaccount_id, multiplier, enabled, bracket_override, max_contracts_override)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            params![
                recorder_id,
                subaccount_id,
                dec_text(multiplier),
                bracket_json,
                max_contracts_override
            ],
        )
        .context("insert trader")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn set_trader_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE traders SET enabled = ?2 WHERE id = ?1",
                params![id, enabled as i64],
            )
            .context("set trader enabled")?;
        Ok(n > 0)
    }

    pub async fn delete_trader(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute("DELETE FROM traders WHERE id = ?1", params![id])
            .context("delete trader")?;
        Ok(n > 0)
    }

    pub async fn list_traders(&self, recorder_id: i64) -> Result<Vec<TraderRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, recorder_id, subaccount_id, multiplier, enabled,
                    bracket_override, max_contracts_override
             FROM traders WHERE recorder_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![recorder_id], |row| {
                let mult: String = row.get(3)?;
                let bracket_json: Option<String> = row.get(5)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    mult,
                    row.get::<_, i64>(4)? != 0,
                    bracket_json,
                    row.get::<_, Option<i64>>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list traders")?;

        rows.into_iter()
            .map(
                |(id, recorder_id, subaccount_id, mult, enabled, bracket_json, max_c)| {
                    Ok(TraderRow {
                        id,
                        recorder_id,
                        subaccount_id,
                        multiplier: dec_parse(&mult)?,
                        enabled,
                        bracket_override: bracket_json
                            .map(|j| serde_json::from_str(&j))
                            .transpose()?,
                        max_contracts_override: max_c,
                    })
                },
            )
            .collect()
    }

    /// Enabled traders of a recorder joined with their routing info.
    /// Soft-deleted accounts are excluded.
    pub async fn list_enabled_trader_targets(&self, recorder_id: i64) -> Result<Vec<TraderTarget>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT t.id, t.subaccount_id, s.broker_account_id, a.id, a.environment,
                    t.multiplier, t.bracket_override, t.max_contracts_override
             FROM traders t
             JOIN subaccounts s ON s.id = t.subaccount_id
             JOIN accounts a ON a.id = s.account_id
             WHERE t.recorder_id = ?1 AND t.enabled = 1 AND a.deleted = 0
             ORDER BY t.id",
        )?;
        let rows = stmt
            .query_map(params![recorder_id], |row| {
                let env: String = row.get(4)?;
                let mult: String = row.get(5)?;
                let bracket_json: Option<String> = row.get(6)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    env,
                    mult,
                    bracket_json,
                    row.get::<_, Option<i64>>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list enabled trader targets")?;

        rows.into_iter()
            .map(
                |(trader_id, subaccount_id, broker_account_id, account_id, env, mult, bracket_json, max_c)| {
                    Ok(TraderTarget {
                        trader_id,
                        subaccount_id,
                        broker_account_id,
                        account_id,
                        environment: if env == "live" {
                            Environment::Live
                        } else {
                            Environment::Demo
                        },
                        multiplier: dec_parse(&mult)?,
                        bracket_override: bracket_json
                            .map(|j| serde_json::from_str(&j))
                            .transpose()?,
                        max_contracts_override: max_c,
                    })
                },
            )
            .collect()
    }

    pub async fn count_enabled_traders(&self, recorder_id: i64) -> Result<u32> {
        let conn = self.conn.lock().await;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM traders WHERE recorder_id = ?1 AND enabled = 1",
                params![recorder_id],
                |r| r.get(0),
            )
            .context("count enabled traders")?;
        Ok(n as u32)
    }

    // -------------------------------------------------------------------------
    // Signal + position transaction
    // -------------------------------------------------------------------------

    /// Commit one signal's full effect: the append-only log row plus the
    /// position mutation, in a single transaction. This is the only write
    /// path for signals and position state transitions.
    pub async fn commit_signal(&self, signal: &SignalRow, change: &PositionChange) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin signal transaction")?;

        tx.execute(
            "INSERT INTO signals
                (id, recorder_id, seq, received_at, action, ticker, price, raw_payload, dedup_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                signal.id,
                signal.recorder_id,
                signal.seq,
                signal.received_at,
                signal.action,
                signal.ticker,
                dec_text(signal.price),
                signal.raw_payload,
                signal.dedup_key
            ],
        )
        .context("append signal")?;

        match change {
            PositionChange::None => {}
            PositionChange::Open(row) => {
                Self::tx_insert_position(&tx, row)?;
            }
            PositionChange::Add {
                id,
                total_quantity,
                avg_entry_price,
            } => {
                tx.execute(
                    "UPDATE positions SET total_quantity = ?2, avg_entry_price = ?3
                     WHERE id = ?1 AND status = 'open'",
                    params![id, total_quantity, dec_text(*avg_entry_price)],
                )
                .context("add to position")?;
            }
            PositionChange::Close {
                id,
                exit_price,
                realized_pnl,
                closed_at,
            } => {
                Self::tx_close_position(&tx, id, *exit_price, *realized_pnl, closed_at)?;
            }
            PositionChange::CloseAndOpen {
                close_id,
                exit_price,
                realized_pnl,
                closed_at,
                open,
            } => {
                Self::tx_close_position(&tx, close_id, *exit_price, *realized_pnl, closed_at)?;
                Self::tx_insert_position(&tx, open)?;
            }
        }

        tx.commit().context("commit signal transaction")
    }

    fn tx_insert_position(tx: &rusqlite::Transaction<'_>, row: &PositionRow) -> Result<()> {
        tx.execute(
            "INSERT INTO positions
                (id, recorder_id, ticker, side, total_quantity, avg_entry_price,
                 current_price, unrealized_pnl, worst_unrealized_pnl, best_unrealized_pnl,
                 point_value, status, opened_at, closed_at, exit_price, realized_pnl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                row.id,
                row.recorder_id,
                row.ticker,
                row.side.to_string(),
                row.total_quantity,
                dec_text(row.avg_entry_price),
                row.current_price.map(dec_text),
                dec_text(row.unrealized_pnl),
                dec_text(row.worst_unrealized_pnl),
                dec_text(row.best_unrealized_pnl),
                dec_text(row.point_value),
                row.status.as_str(),
                row.opened_at,
                row.closed_at,
                row.exit_price.map(dec_text),
                dec_text(row.realized_pnl)
            ],
        )
        .context("insert position")?;
        Ok(())
    }

    fn tx_close_position(
        tx: &rusqlite::Transaction<'_>,
        id: &str,
        exit_price: Decimal,
        realized_pnl: Decimal,
        closed_at: &str,
    ) -> Result<()> {
        tx.execute(
            "UPDATE positions
             SET status = 'closed', exit_price = ?2, realized_pnl = ?3, closed_at = ?4,
                 unrealized_pnl = '0'
             WHERE id = ?1 AND status = 'open'",
            params![id, dec_text(exit_price), dec_text(realized_pnl), closed_at],
        )
        .context("close position")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    fn position_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(PositionRow, Vec<String>)> {
        // Decimal parsing happens outside rusqlite's error type; collect the
        // raw strings here.
        let side: String = row.get("side")?;
        let status: String = row.get("status")?;
        let raw = vec![
            row.get::<_, String>("avg_entry_price")?,
            row.get::<_, Option<String>>("current_price")?.unwrap_or_default(),
            row.get::<_, String>("unrealized_pnl")?,
            row.get::<_, String>("worst_unrealized_pnl")?,
            row.get::<_, String>("best_unrealized_pnl")?,
            row.get::<_, String>("point_value")?,
            row.get::<_, Option<String>>("exit_price")?.unwrap_or_default(),
            row.get::<_, String>("realized_pnl")?,
        ];
        Ok((
            PositionRow {
                id: row.get("id")?,
                recorder_id: row.get("recorder_id")?,
                ticker: row.get("ticker")?,
                side: if side == "SHORT" { Side::Short } else { Side::Long },
                total_quantity: row.get("total_quantity")?,
                avg_entry_price: Decimal::ZERO,
                current_price: None,
                unrealized_pnl: Decimal::ZERO,
                worst_unrealized_pnl: Decimal::ZERO,
                best_unrealized_pnl: Decimal::ZERO,
                point_value: Decimal::ONE,
                status: PositionStatus::parse(&status),
                opened_at: row.get("opened_at")?,
                closed_at: row.get("closed_at")?,
                exit_price: None,
                realized_pnl: Decimal::ZERO,
            },
            raw,
        ))
    }

    fn finish_position((mut pos, raw): (PositionRow, Vec<String>)) -> Result<PositionRow> {
        pos.avg_entry_price = dec_parse(&raw[0])?;
        pos.current_price = if raw[1].is_empty() {
            None
        } else {
            Some(dec_parse(&raw[1])?)
        };
        pos.unrealized_pnl = dec_parse(&raw[2])?;
        pos.worst_unrealized_pnl = dec_parse(&raw[3])?;
        pos.best_unrealized_pnl = dec_parse(&raw[4])?;
        pos.point_value = dec_parse(&raw[5])?;
        pos.exit_price = if raw[6].is_empty() {
            None
        } else {
            Some(dec_parse(&raw[6])?)
        };
        pos.realized_pnl = dec_parse(&raw[7])?;
        Ok(pos)
    }

    pub async fn get_open_position(
        &self,
        recorder_id: i64,
        ticker: &str,
    ) -> Result<Option<PositionRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT * FROM positions
                 WHERE recorder_id = ?1 AND ticker = ?2 AND status = 'open'",
                params![recorder_id, ticker],
                Self::position_from_row,
            )
            .optional()
            .context("get open position")?;
        row.map(Self::finish_position).transpose()
    }

    pub async fn list_open_positions(&self) -> Result<Vec<PositionRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM positions WHERE status = 'open'")?;
        let rows = stmt
            .query_map([], Self::position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list open positions")?;
        rows.into_iter().map(Self::finish_position).collect()
    }

    pub async fn list_open_positions_for(&self, recorder_id: i64) -> Result<Vec<PositionRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM positions WHERE recorder_id = ?1 AND status = 'open'")?;
        let rows = stmt
            .query_map(params![recorder_id], Self::position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list open positions for recorder")?;
        rows.into_iter().map(Self::finish_position).collect()
    }

    pub async fn list_closed_positions(
        &self,
        recorder_id: i64,
        limit: usize,
    ) -> Result<Vec<PositionRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM positions WHERE recorder_id = ?1 AND status = 'closed'
             ORDER BY closed_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![recorder_id, limit as i64], Self::position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list closed positions")?;
        rows.into_iter().map(Self::finish_position).collect()
    }

    /// Drawdown poller write path: marks only, never quantity or status.
    pub async fn update_position_marks(
        &self,
        id: &str,
        current_price: Decimal,
        unrealized_pnl: Decimal,
        worst_unrealized_pnl: Decimal,
        best_unrealized_pnl: Decimal,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions
             SET current_price = ?2, unrealized_pnl = ?3,
                 worst_unrealized_pnl = ?4, best_unrealized_pnl = ?5
             WHERE id = ?1 AND status = 'open'",
            params![
                id,
                dec_text(current_price),
                dec_text(unrealized_pnl),
                dec_text(worst_unrealized_pnl),
                dec_text(best_unrealized_pnl)
            ],
        )
        .context("update position marks")?;
        Ok(())
    }

    /// Quantity reduction from a fired trim target. Realized P&L from the
    /// trim accumulates on the still-open row.
    pub async fn trim_position(
        &self,
        id: &str,
        new_quantity: i64,
        realized_pnl_total: Decimal,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET total_quantity = ?2, realized_pnl = ?3
             WHERE id = ?1 AND status = 'open'",
            params![id, new_quantity, dec_text(realized_pnl_total)],
        )
        .context("trim position")?;
        Ok(())
    }

    /// Close an open row outside the signal path (bracket watcher fires).
    pub async fn close_position_direct(
        &self,
        id: &str,
        exit_price: Decimal,
        realized_pnl: Decimal,
        closed_at: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions
             SET status = 'closed', exit_price = ?2, realized_pnl = ?3, closed_at = ?4,
                 unrealized_pnl = '0'
             WHERE id = ?1 AND status = 'open'",
            params![id, dec_text(exit_price), dec_text(realized_pnl), closed_at],
        )
        .context("close position direct")?;
        Ok(())
    }

    /// Enabled (recorder, multiplier) links routed through one subaccount.
    pub async fn list_trader_links_for_subaccount(
        &self,
        subaccount_id: i64,
    ) -> Result<Vec<(i64, Decimal)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT recorder_id, multiplier FROM traders
             WHERE subaccount_id = ?1 AND enabled = 1",
        )?;
        let rows = stmt
            .query_map(params![subaccount_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list trader links for subaccount")?;
        rows.into_iter()
            .map(|(r, m)| Ok((r, dec_parse(&m)?)))
            .collect()
    }

    /// Every enabled (account, recorder, multiplier) link, for account-level
    /// P&L aggregation.
    pub async fn list_account_trader_links(&self) -> Result<Vec<(i64, i64, Decimal)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT a.id, t.recorder_id, t.multiplier
             FROM traders t
             JOIN subaccounts s ON s.id = t.subaccount_id
             JOIN accounts a ON a.id = s.account_id
             WHERE t.enabled = 1 AND a.deleted = 0",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list account trader links")?;
        rows.into_iter()
            .map(|(a, r, m)| Ok((a, r, dec_parse(&m)?)))
            .collect()
    }

    /// Sum of realized P&L for positions of this recorder closed at or
    /// after `cutoff` (RFC 3339). Trims on still-open rows are excluded;
    /// they realize on close.
    pub async fn realized_pnl_since(&self, recorder_id: i64, cutoff: &str) -> Result<Decimal> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT realized_pnl FROM positions
             WHERE recorder_id = ?1 AND status = 'closed' AND closed_at >= ?2",
        )?;
        let values = stmt
            .query_map(params![recorder_id, cutoff], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("realized pnl since")?;
        let mut total = Decimal::ZERO;
        for v in values {
            total += dec_parse(&v)?;
        }
        Ok(total)
    }

    pub async fn count_signals(&self, recorder_id: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE recorder_id = ?1",
            params![recorder_id],
            |r| r.get(0),
        )
        .context("count signals")
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub async fn insert_trade(&self, trade: &TradeRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades
                (id, correlation_id, trader_id, signal_id, symbol, contract, side,
                 quantity, requested_price, fill_price, broker_order_id,
                 tp_order_id, sl_order_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                trade.id,
                trade.correlation_id,
                trade.trader_id,
                trade.signal_id,
                trade.symbol,
                trade.contract,
                trade.side,
                trade.quantity,
                trade.requested_price.map(dec_text),
                trade.fill_price.map(dec_text),
                trade.broker_order_id,
                trade.tp_order_id,
                trade.sl_order_id,
                trade.status.as_str(),
                trade.created_at
            ],
        )
        .context("insert trade")?;
        Ok(())
    }

    pub async fn set_trade_fill(
        &self,
        id: &str,
        fill_price: Decimal,
        status: TradeStatus,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trades SET fill_price = ?2, status = ?3 WHERE id = ?1",
            params![id, dec_text(fill_price), status.as_str()],
        )
        .context("set trade fill")?;
        Ok(())
    }

    pub async fn list_recent_trades(&self, limit: usize) -> Result<Vec<TradeRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, correlation_id, trader_id, signal_id, symbol, contract, side,
                    quantity, requested_price, fill_price, broker_order_id,
                    tp_order_id, sl_order_id, status, created_at
             FROM trades ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, String>(14)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list recent trades")?;

        rows.into_iter()
            .map(
                |(id, correlation_id, trader_id, signal_id, symbol, contract, side, quantity, req, fill, boid, tpid, slid, status, created_at)| {
                    Ok(TradeRow {
                        id,
                        correlation_id,
                        trader_id,
                        signal_id,
                        symbol,
                        contract,
                        side,
                        quantity,
                        requested_price: dec_opt(req)?,
                        fill_price: dec_opt(fill)?,
                        broker_order_id: boid,
                        tp_order_id: tpid,
                        sl_order_id: slid,
                        status: TradeStatus::parse(&status),
                        created_at,
                    })
                },
            )
            .collect()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn seeded() -> (Store, i64, i64) {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("ops", "x").await.unwrap();
        let rec = store
            .insert_recorder(
                user,
                "mnq-scalper",
                "MNQ1!",
                1,
                1,
                false,
                &FilterConfig::default(),
                &BracketSpec::default(),
                None,
            )
            .await
            .unwrap();
        (store, user, rec.id)
    }

    fn open_row(recorder_id: i64, ticker: &str, qty: i64, avg: Decimal) -> PositionRow {
        PositionRow {
            id: uuid::Uuid::new_v4().to_string(),
            recorder_id,
            ticker: ticker.to_string(),
            side: Side::Long,
            total_quantity: qty,
            avg_entry_price: avg,
            current_price: None,
            unrealized_pnl: Decimal::ZERO,
            worst_unrealized_pnl: Decimal::ZERO,
            best_unrealized_pnl: Decimal::ZERO,
            point_value: dec!(2),
            status: PositionStatus::Open,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
            exit_price: None,
            realized_pnl: Decimal::ZERO,
        }
    }

    fn signal_row(store: &Store, recorder_id: i64, action: &str, price: Decimal) -> SignalRow {
        SignalRow {
            id: uuid::Uuid::new_v4().to_string(),
            recorder_id,
            seq: store.next_signal_seq(),
            received_at: Utc::now().to_rfc3339(),
            action: action.to_string(),
            ticker: "MNQ1!".to_string(),
            price,
            raw_payload: "{}".to_string(),
            dedup_key: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[tokio::test]
    async fn open_and_close_roundtrip() {
        let (store, _user, rec) = seeded().await;

        let row = open_row(rec, "MNQ1!", 1, dec!(25600));
        let row_id = row.id.clone();
        let sig = signal_row(&store, rec, "buy", dec!(25600));
        store
            .commit_signal(&sig, &PositionChange::Open(row))
            .await
            .unwrap();

        let open = store.get_open_position(rec, "MNQ1!").await.unwrap().unwrap();
        assert_eq!(open.total_quantity, 1);
        assert_eq!(open.avg_entry_price, dec!(25600));
        assert_eq!(open.point_value, dec!(2));

        let sig2 = signal_row(&store, rec, "close", dec!(25620));
        store
            .commit_signal(
                &sig2,
                &PositionChange::Close {
                    id: row_id,
                    exit_price: dec!(25620),
                    realized_pnl: dec!(40),
                    closed_at: Utc::now().to_rfc3339(),
                },
            )
            .await
            .unwrap();

        assert!(store.get_open_position(rec, "MNQ1!").await.unwrap().is_none());
        let closed = store.list_closed_positions(rec, 10).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].realized_pnl, dec!(40));
        assert_eq!(closed[0].exit_price, Some(dec!(25620)));
    }

    #[tokio::test]
    async fn partial_index_rejects_second_open_position() {
        let (store, _user, rec) = seeded().await;

        let sig = signal_row(&store, rec, "buy", dec!(100));
        store
            .commit_signal(&sig, &PositionChange::Open(open_row(rec, "MNQ1!", 1, dec!(100))))
            .await
            .unwrap();

        let sig2 = signal_row(&store, rec, "buy", dec!(101));
        let err = store
            .commit_signal(&sig2, &PositionChange::Open(open_row(rec, "MNQ1!", 1, dec!(101))))
            .await;
        assert!(err.is_err(), "second open row for same key must violate the partial index");

        // The transaction rolled back: the second signal was not appended.
        assert_eq!(store.count_signals(rec).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flip_commits_close_and_open_atomically() {
        let (store, _user, rec) = seeded().await;

        let long = open_row(rec, "MNQ1!", 2, dec!(25605));
        let long_id = long.id.clone();
        let sig = signal_row(&store, rec, "buy", dec!(25605));
        store
            .commit_signal(&sig, &PositionChange::Open(long))
            .await
            .unwrap();

        let mut short = open_row(rec, "MNQ1!", 1, dec!(25620));
        short.side = Side::Short;
        let sig2 = signal_row(&store, rec, "sell", dec!(25620));
        store
            .commit_signal(
                &sig2,
                &PositionChange::CloseAndOpen {
                    close_id: long_id,
                    exit_price: dec!(25620),
                    realized_pnl: dec!(60),
                    closed_at: Utc::now().to_rfc3339(),
                    open: short,
                },
            )
            .await
            .unwrap();

        let open = store.get_open_position(rec, "MNQ1!").await.unwrap().unwrap();
        assert_eq!(open.side, Side::Short);
        assert_eq!(open.total_quantity, 1);
        let closed = store.list_closed_positions(rec, 10).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].realized_pnl, dec!(60));
    }

    #[tokio::test]
    async fn realized_pnl_since_only_counts_closed_after_cutoff() {
        let (store, _user, rec) = seeded().await;

        let row = open_row(rec, "MNQ1!", 1, dec!(100));
        let id = row.id.clone();
        let sig = signal_row(&store, rec, "buy", dec!(100));
        store.commit_signal(&sig, &PositionChange::Open(row)).await.unwrap();
        let sig2 = signal_row(&store, rec, "close", dec!(90));
        store
            .commit_signal(
                &sig2,
                &PositionChange::Close {
                    id,
                    exit_price: dec!(90),
                    realized_pnl: dec!(-20),
                    closed_at: "2026-03-04T15:00:00+00:00".to_string(),
                },
            )
            .await
            .unwrap();

        let today = store
            .realized_pnl_since(rec, "2026-03-04T00:00:00+00:00")
            .await
            .unwrap();
        assert_eq!(today, dec!(-20));

        let tomorrow = store
            .realized_pnl_since(rec, "2026-03-05T00:00:00+00:00")
            .await
            .unwrap();
        assert_eq!(tomorrow, Decimal::ZERO);
    }

    #[tokio::test]
    async fn rotate_token_invalidates_old_mapping() {
        let (store, _user, rec) = seeded().await;
        let before = store.webhook_token_entries().await.unwrap();
        let old = before[0].token.clone();

        let new = store.rotate_webhook_token(rec).await.unwrap().unwrap();
        assert_ne!(old, new);

        let after = store.webhook_token_entries().await.unwrap();
        assert!(after.iter().all(|e| e.token != old));
        assert!(after.iter().any(|e| e.token == new));
    }

    #[tokio::test]
    async fn trader_targets_exclude_deleted_accounts() {
        let (store, user, rec) = seeded().await;
        let acct = store
            .insert_account(user, "apex", Environment::Demo, "cid", "secret")
            .await
            .unwrap();
        let sub = store.insert_subaccount(acct, 77001, "APEX-1").await.unwrap();
        store
            .insert_trader(rec, sub, dec!(5), None, None)
            .await
            .unwrap();

        let targets = store.list_enabled_trader_targets(rec).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].multiplier, dec!(5));
        assert_eq!(targets[0].broker_account_id, 77001);

        store.soft_delete_account(acct).await.unwrap();
        let targets = store.list_enabled_trader_targets(rec).await.unwrap();
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn webhook_token_is_128_bit_hex() {
        let token = generate_webhook_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
