// =============================================================================
// State recovery — reconcile the local store against the venue on startup
// =============================================================================
//
// Pulls open orders and non-zero positions from the venue, upserts them into
// the store, and reports every discrepancy (local rows unknown to the venue
// and vice versa) to the signal journal. Discrepancies are never auto-healed
// silently: local rows stay in place for the operator to inspect.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::execution::ExecutionGateway;
use crate::storage::{SignalJournal, SqliteStore, StoredOrder, StoredPosition};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub venue_open_orders: usize,
    pub venue_positions: usize,
    /// Order ids present locally but not on the venue.
    pub orders_missing_on_venue: Vec<String>,
    /// Order ids present on the venue but not locally (now upserted).
    pub orders_missing_locally: Vec<String>,
    /// Symbols with a local position the venue does not report.
    pub positions_missing_on_venue: Vec<String>,
    /// Symbols with a venue position the store did not know (now upserted).
    pub positions_missing_locally: Vec<String>,
}

impl RecoveryReport {
    pub fn has_discrepancies(&self) -> bool {
        !self.orders_missing_on_venue.is_empty()
            || !self.orders_missing_locally.is_empty()
            || !self.positions_missing_on_venue.is_empty()
            || !self.positions_missing_locally.is_empty()
    }
}

/// Run startup recovery. Returns the discrepancy report after journaling it.
pub async fn recover_state(
    gateway: &dyn ExecutionGateway,
    store: &SqliteStore,
    journal: &SignalJournal,
) -> anyhow::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    // --- Orders --------------------------------------------------------------
    let venue_orders = gateway.get_open_orders(None).await;
    report.venue_open_orders = venue_orders.len();

    let local_orders = store.open_orders(None)?;
    let now = Utc::now().timestamp_millis();

    for order in &venue_orders {
        let known = local_orders.iter().any(|o| o.order_id == order.order_id);
        if !known {
            report.orders_missing_locally.push(order.order_id.clone());
        }
        store.upsert_order(&StoredOrder {
            order_id: order.order_id.clone(),
            order_link_id: order.order_link_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side.to_string(),
            order_type: order.order_type.to_string(),
            price: order.price,
            qty: order.qty,
            filled_qty: 0.0,
            status: order.status.clone(),
            time_in_force: None,
            created_time: now,
            updated_time: now,
            raw: None,
        })?;
    }

    for local in &local_orders {
        if !venue_orders.iter().any(|o| o.order_id == local.order_id) {
            report.orders_missing_on_venue.push(local.order_id.clone());
        }
    }

    // --- Positions -----------------------------------------------------------
    let venue_positions = gateway.get_positions().await;
    report.venue_positions = venue_positions.len();

    let local_positions = store.positions()?;

    for position in &venue_positions {
        let known = local_positions.iter().any(|p| p.symbol == position.symbol);
        if !known {
            report.positions_missing_locally.push(position.symbol.clone());
        }
        store.upsert_position(&StoredPosition {
            symbol: position.symbol.clone(),
            side: position.side.to_string(),
            qty: position.qty,
            entry_price: position.entry_price,
            stop_loss: None,
            take_profit: None,
            pyramid_level: 1,
            strategy_id: None,
            created_at: now,
        })?;
    }

    for local in &local_positions {
        if !venue_positions.iter().any(|p| p.symbol == local.symbol) {
            report.positions_missing_on_venue.push(local.symbol.clone());
        }
    }

    // --- Report --------------------------------------------------------------
    if report.has_discrepancies() {
        warn!(
            orders_missing_on_venue = report.orders_missing_on_venue.len(),
            orders_missing_locally = report.orders_missing_locally.len(),
            positions_missing_on_venue = report.positions_missing_on_venue.len(),
            positions_missing_locally = report.positions_missing_locally.len(),
            "state recovery found discrepancies"
        );
        for order_id in &report.orders_missing_on_venue {
            journal.debug("RECOVERY", &format!("local order {order_id} not on venue"));
        }
        for order_id in &report.orders_missing_locally {
            journal.debug("RECOVERY", &format!("venue order {order_id} was not in local store"));
        }
        for symbol in &report.positions_missing_on_venue {
            journal.debug(symbol, "local position not reported by venue");
        }
        for symbol in &report.positions_missing_locally {
            journal.debug(symbol, "venue position was not in local store");
        }
    } else {
        info!(
            orders = report.venue_open_orders,
            positions = report.venue_positions,
            "state recovery clean"
        );
    }

    Ok(report)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{BacktestGateway, HaltFlag, OrderRequest};
    use crate::types::Side;

    async fn setup() -> (tempfile::TempDir, BacktestGateway, SqliteStore, SignalJournal) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("recovery.db")).unwrap();
        let journal = SignalJournal::open(dir.path().join("j.jsonl")).unwrap();
        let gateway = BacktestGateway::new(10_000.0, HaltFlag::new(false));
        (dir, gateway, store, journal)
    }

    #[tokio::test]
    async fn venue_state_is_upserted_and_flagged() {
        let (_dir, gateway, store, journal) = setup().await;

        // Venue has a position and a resting order the store knows nothing
        // about.
        gateway
            .place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0).reference_price(100.0))
            .await;
        gateway
            .place_order(OrderRequest::limit("ETHUSDT", Side::Buy, 1.0, 2900.0))
            .await;

        let report = recover_state(&gateway, &store, &journal).await.unwrap();

        assert_eq!(report.venue_positions, 1);
        assert_eq!(report.venue_open_orders, 1);
        assert_eq!(report.positions_missing_locally, vec!["BTCUSDT"]);
        assert_eq!(report.orders_missing_locally.len(), 1);

        // Upserted into the store.
        assert_eq!(store.positions().unwrap().len(), 1);
        assert_eq!(store.open_orders(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_orphans_are_reported_not_deleted() {
        let (_dir, gateway, store, journal) = setup().await;

        // Store believes in a position and an order that the venue lacks.
        store
            .upsert_position(&StoredPosition {
                symbol: "SOLUSDT".into(),
                side: "Long".into(),
                qty: 5.0,
                entry_price: 100.0,
                stop_loss: None,
                take_profit: None,
                pyramid_level: 1,
                strategy_id: None,
                created_at: 0,
            })
            .unwrap();
        store
            .upsert_order(&StoredOrder {
                order_id: "ghost-1".into(),
                order_link_id: None,
                symbol: "SOLUSDT".into(),
                side: "Buy".into(),
                order_type: "Limit".into(),
                price: Some(90.0),
                qty: 1.0,
                filled_qty: 0.0,
                status: "New".into(),
                time_in_force: None,
                created_time: 0,
                updated_time: 0,
                raw: None,
            })
            .unwrap();

        let report = recover_state(&gateway, &store, &journal).await.unwrap();

        assert_eq!(report.positions_missing_on_venue, vec!["SOLUSDT"]);
        assert_eq!(report.orders_missing_on_venue, vec!["ghost-1"]);
        assert!(report.has_discrepancies());

        // Never auto-healed: local rows are still there.
        assert_eq!(store.positions().unwrap().len(), 1);
        assert_eq!(store.open_orders(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clean_state_reports_no_discrepancies() {
        let (_dir, gateway, store, journal) = setup().await;
        let report = recover_state(&gateway, &store, &journal).await.unwrap();
        assert!(!report.has_discrepancies());
    }
}
