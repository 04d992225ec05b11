// =============================================================================
// Symbol Resolution — ticker roots, instrument point values, and contract
// lookup with a daily cache and a static fallback
// =============================================================================
//
// TradingView tickers arrive as continuous-contract aliases ("MNQ1!"); the
// broker trades dated contracts ("MNQM6"). Resolution asks the adapter
// first and falls back to computing the front quarterly contract locally,
// so a broker outage never blocks dispatch. Results are cached per
// (root, environment, day).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::broker::adapter::BrokerAdapter;
use crate::types::Environment;

// ---------------------------------------------------------------------------
// Point values
// ---------------------------------------------------------------------------

/// Dollar value of one point of price movement, keyed by ticker root.
pub fn point_value(root: &str) -> Option<Decimal> {
    let value = match root {
        "ES" => dec!(50),
        "MES" => dec!(5),
        "NQ" => dec!(20),
        "MNQ" => dec!(2),
        "RTY" => dec!(50),
        "M2K" => dec!(5),
        "YM" => dec!(5),
        "MYM" => dec!(0.5),
        "CL" => dec!(1000),
        "MCL" => dec!(100),
        "GC" => dec!(100),
        "MGC" => dec!(10),
        _ => return None,
    };
    Some(value)
}

/// Minimum price increment, keyed by ticker root.
pub fn tick_size(root: &str) -> Option<Decimal> {
    let size = match root {
        "ES" | "MES" | "NQ" | "MNQ" => dec!(0.25),
        "RTY" | "M2K" => dec!(0.1),
        "YM" | "MYM" => dec!(1),
        "CL" | "MCL" => dec!(0.01),
        "GC" | "MGC" => dec!(0.1),
        _ => return None,
    };
    Some(size)
}

/// Tick size with a 1.0 fallback for unknown roots.
pub fn tick_size_or_default(root: &str) -> Decimal {
    tick_size(root).unwrap_or(Decimal::ONE)
}

/// Point value with the documented unknown-root behaviour: warn and fall
/// back to 1.0 — a missing lookup must never drop a signal.
pub fn point_value_or_default(root: &str) -> Decimal {
    match point_value(root) {
        Some(v) => v,
        None => {
            warn!(root, "unknown ticker root — using point value 1.0");
            Decimal::ONE
        }
    }
}

/// Leading alphabetic characters of a ticker, uppercased: "MNQ1!" -> "MNQ".
pub fn ticker_root(ticker: &str) -> String {
    ticker
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

// ---------------------------------------------------------------------------
// Front-month fallback
// ---------------------------------------------------------------------------

/// Quarterly expiry month codes (Mar, Jun, Sep, Dec).
const QUARTERLY: [(u32, char); 4] = [(3, 'H'), (6, 'M'), (9, 'U'), (12, 'Z')];

/// Compute the front quarterly contract for `root` at `at_time` without
/// asking the broker. Rolls to the next quarter mid-expiry-month (futures
/// volume migrates around the second week).
pub fn front_quarterly_contract(root: &str, at_time: DateTime<Utc>) -> String {
    let month = at_time.month();
    let day = at_time.day();
    let year = at_time.year();

    let (expiry_month, code) = QUARTERLY
        .iter()
        .copied()
        .find(|&(m, _)| month < m || (month == m && day < 15))
        .unwrap_or(QUARTERLY[0]);

    let contract_year = if expiry_month < month || (expiry_month == month && day >= 15) {
        year + 1
    } else {
        year
    };

    format!("{root}{code}{}", contract_year % 10)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

type CacheKey = (String, Environment, String);

/// Contract resolver with a per-(root, environment, day) cache.
pub struct SymbolResolver {
    adapter: Option<Arc<dyn BrokerAdapter>>,
    cache: RwLock<HashMap<CacheKey, String>>,
}

impl SymbolResolver {
    pub fn new(adapter: Option<Arc<dyn BrokerAdapter>>) -> Self {
        Self {
            adapter,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a ticker to the tradable contract at `at_time`.
    pub async fn resolve(
        &self,
        ticker: &str,
        environment: Environment,
        at_time: DateTime<Utc>,
    ) -> String {
        let root = ticker_root(ticker);
        let day = at_time.format("%Y-%m-%d").to_string();
        let key = (root.clone(), environment, day);

        if let Some(hit) = self.cache.read().get(&key) {
            return hit.clone();
        }

        let resolved = match &self.adapter {
            Some(adapter) => match adapter.resolve_symbol(environment, &root).await {
                Ok(contract) => contract,
                Err(e) => {
                    let fallback = front_quarterly_contract(&root, at_time);
                    warn!(
                        root = %root,
                        error = %e,
                        fallback = %fallback,
                        "broker symbol lookup failed — using computed front contract"
                    );
                    fallback
                }
            },
            None => front_quarterly_contract(&root, at_time),
        };

        debug!(ticker, root = %root, contract = %resolved, env = %environment, "symbol resolved");
        self.cache.write().insert(key, resolved.clone());
        resolved
    }
}

impl std::fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ticker_root_strips_continuous_suffix() {
        assert_eq!(ticker_root("MNQ1!"), "MNQ");
        assert_eq!(ticker_root("mes1!"), "MES");
        assert_eq!(ticker_root("ES"), "ES");
        assert_eq!(ticker_root("GC2!"), "GC");
    }

    #[test]
    fn point_values_match_contract_specs() {
        assert_eq!(point_value("MES"), Some(dec!(5)));
        assert_eq!(point_value("MNQ"), Some(dec!(2)));
        assert_eq!(point_value("ES"), Some(dec!(50)));
        assert_eq!(point_value("NQ"), Some(dec!(20)));
        assert_eq!(point_value("ZB"), None);
    }

    #[test]
    fn unknown_root_defaults_to_one() {
        assert_eq!(point_value_or_default("ZB"), Decimal::ONE);
        assert_eq!(point_value_or_default("MNQ"), dec!(2));
    }

    #[test]
    fn front_contract_rolls_quarterly() {
        let feb = Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap();
        assert_eq!(front_quarterly_contract("MNQ", feb), "MNQH6");

        // Early March still trades the March contract.
        let early_march = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(front_quarterly_contract("MNQ", early_march), "MNQH6");

        // Mid-March has rolled to June.
        let late_march = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
        assert_eq!(front_quarterly_contract("MNQ", late_march), "MNQM6");

        // Mid-December rolls into next year's March.
        let late_dec = Utc.with_ymd_and_hms(2026, 12, 20, 12, 0, 0).unwrap();
        assert_eq!(front_quarterly_contract("ES", late_dec), "ESH7");
    }

    #[tokio::test]
    async fn resolver_without_adapter_uses_fallback_and_caches() {
        let resolver = SymbolResolver::new(None);
        let at = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();

        let a = resolver.resolve("MNQ1!", Environment::Demo, at).await;
        assert_eq!(a, "MNQM6");

        // Cache key includes the environment.
        let b = resolver.resolve("MNQ1!", Environment::Live, at).await;
        assert_eq!(b, "MNQM6");
        assert_eq!(resolver.cache.read().len(), 2);
    }
}
