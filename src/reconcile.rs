// =============================================================================
// Reconciliation Audit — compare broker net positions against engine state
// =============================================================================
//
// SAFETY POLICY: this module logs warnings for any drift it discovers but
// will **never** touch engine positions or cancel broker orders. The
// engine's position is signal-derived by design; the audit exists so an
// operator can see when broker reality has diverged (missed fill, manual
// intervention, bracket fired broker-side) and resolve it deliberately.
//
// This is the only consumer of the adapter's get_positions operation.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::adapter::BrokerAdapter;
use crate::broker::pool::ConnectionPool;
use crate::broker::symbols::ticker_root;
use crate::store::Store;

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    pub subaccounts_checked: u32,
    /// Contract roots whose broker net quantity matched the engine's
    /// scaled expectation.
    pub roots_matched: u32,
    /// Roots where broker and engine disagree.
    pub drifts: u32,
    /// Broker positions with no engine counterpart at all.
    pub orphans: u32,
    pub timestamp: String,
}

/// Run one audit cycle over every subaccount that has enabled traders.
pub async fn reconcile_once(
    store: &Store,
    pool: &ConnectionPool,
    adapter: &Arc<dyn BrokerAdapter>,
) -> Result<ReconcileResult> {
    let now = Utc::now().to_rfc3339();
    let mut result = ReconcileResult {
        subaccounts_checked: 0,
        roots_matched: 0,
        drifts: 0,
        orphans: 0,
        timestamp: now.clone(),
    };

    for account in store.list_active_accounts().await? {
        if account.requires_reauth || account.refresh_token.is_none() {
            continue;
        }

        for subaccount in store.list_subaccounts(account.id).await? {
            let links = store.list_trader_links_for_subaccount(subaccount.id).await?;
            if links.is_empty() {
                continue;
            }

            // Expected net quantity per root, from the engine's positions
            // scaled through each linked trader's multiplier.
            let mut expected: HashMap<String, i64> = HashMap::new();
            for (recorder_id, multiplier) in &links {
                for position in store.list_open_positions_for(*recorder_id).await? {
                    let scaled = (rust_decimal::Decimal::from(position.total_quantity)
                        * multiplier)
                        .round()
                        .to_i64()
                        .unwrap_or(0);
                    let signed = match position.side {
                        crate::types::Side::Long => scaled,
                        crate::types::Side::Short => -scaled,
                    };
                    *expected.entry(ticker_root(&position.ticker)).or_default() += signed;
                }
            }

            let session = match pool.session(subaccount.id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(subaccount_id = subaccount.id, error = %e, "reconcile: no session");
                    continue;
                }
            };
            let token = match session.access_token().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(subaccount_id = subaccount.id, error = %e, "reconcile: no token");
                    continue;
                }
            };
            let broker_positions = match adapter
                .get_positions(session.environment, &token, session.broker_account_id)
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    warn!(subaccount_id = subaccount.id, error = %e, "reconcile: position fetch failed");
                    continue;
                }
            };
            result.subaccounts_checked += 1;

            let mut broker_by_root: HashMap<String, i64> = HashMap::new();
            for bp in &broker_positions {
                *broker_by_root.entry(ticker_root(&bp.contract)).or_default() += bp.net_qty;
            }

            for (root, expected_qty) in &expected {
                let broker_qty = broker_by_root.remove(root).unwrap_or(0);
                if broker_qty == *expected_qty {
                    result.roots_matched += 1;
                    debug!(
                        subaccount_id = subaccount.id,
                        root = %root,
                        qty = broker_qty,
                        "reconcile: matched"
                    );
                } else {
                    result.drifts += 1;
                    warn!(
                        subaccount_id = subaccount.id,
                        root = %root,
                        engine_qty = expected_qty,
                        broker_qty,
                        "reconcile: DRIFT between engine and broker — operator action required"
                    );
                }
            }

            // Whatever remains broker-side has no engine counterpart.
            for (root, qty) in broker_by_root {
                if qty != 0 {
                    result.orphans += 1;
                    warn!(
                        subaccount_id = subaccount.id,
                        root = %root,
                        broker_qty = qty,
                        "reconcile: orphan broker position with no engine counterpart"
                    );
                }
            }
        }
    }

    info!(
        subaccounts = result.subaccounts_checked,
        matched = result.roots_matched,
        drifts = result.drifts,
        orphans = result.orphans,
        "reconciliation cycle completed"
    );
    Ok(result)
}
