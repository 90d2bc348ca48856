// =============================================================================
// Order manager — authoritative order lifecycle and fill reconciliation
// =============================================================================
//
// Lifecycle: New -> PartiallyFilled? -> Filled | Cancelled | Rejected.
// Exchange-reported status is reconciled into the local record and persisted
// on every transition. Reconciliation is idempotent: duplicate
// acknowledgments and duplicate fill notices never double-apply.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::{SqliteStore, StoredOrder};
use crate::types::{OrderType, Side, TimeInForce};

use super::ExecutionFill;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "New" => Some(Self::New),
            "PartiallyFilled" => Some(Self::PartiallyFilled),
            "Filled" => Some(Self::Filled),
            "Cancelled" => Some(Self::Cancelled),
            "Rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::PartiallyFilled => write!(f, "PartiallyFilled"),
            Self::Filled => write!(f, "Filled"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Rejected => write!(f, "Rejected"),
        }
    }
}

/// Local order record mirroring the venue's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub order_link_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub qty: f64,
    pub filled_qty: f64,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub created_time: i64,
    pub updated_time: i64,
}

/// Exchange-reported order state used for reconciliation.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub updated_time: i64,
}

pub struct OrderManager {
    orders: RwLock<HashMap<String, OrderRecord>>,
    store: SqliteStore,
}

impl OrderManager {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            store,
        }
    }

    fn persist(&self, record: &OrderRecord) {
        let stored = StoredOrder {
            order_id: record.order_id.clone(),
            order_link_id: record.order_link_id.clone(),
            symbol: record.symbol.clone(),
            side: record.side.to_string(),
            order_type: record.order_type.to_string(),
            price: record.price,
            qty: record.qty,
            filled_qty: record.filled_qty,
            status: record.status.to_string(),
            time_in_force: Some(record.time_in_force.to_string()),
            created_time: record.created_time,
            updated_time: record.updated_time,
            raw: None,
        };
        if let Err(e) = self.store.upsert_order(&stored) {
            warn!(order_id = %record.order_id, error = %e, "failed to persist order");
        }
    }

    /// Record a freshly submitted order as New.
    pub fn track_new_order(
        &self,
        order_id: &str,
        order_link_id: Option<String>,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        qty: f64,
        price: Option<f64>,
        time_in_force: TimeInForce,
    ) -> OrderRecord {
        let now = Utc::now().timestamp_millis();
        let record = OrderRecord {
            order_id: order_id.to_string(),
            order_link_id,
            symbol: symbol.to_string(),
            side,
            order_type,
            price,
            qty,
            filled_qty: 0.0,
            status: OrderStatus::New,
            time_in_force,
            created_time: now,
            updated_time: now,
        };
        info!(order_id, symbol, side = %side, qty, "order tracked as New");
        self.persist(&record);
        self.orders
            .write()
            .insert(order_id.to_string(), record.clone());
        record
    }

    /// Reconcile an exchange-reported status into the local record.
    ///
    /// Idempotent: a duplicate acknowledgment (same status, same filled qty)
    /// is a no-op, and a terminal record never regresses.
    pub fn reconcile(&self, update: &OrderUpdate) -> Option<OrderRecord> {
        let mut orders = self.orders.write();
        let record = match orders.get_mut(&update.order_id) {
            Some(r) => r,
            None => {
                debug!(order_id = %update.order_id, "reconcile for unknown order — ignoring");
                return None;
            }
        };

        if record.status.is_terminal() {
            debug!(
                order_id = %update.order_id,
                status = %record.status,
                "duplicate ack on terminal order — no-op"
            );
            return Some(record.clone());
        }

        if record.status == update.status
            && (record.filled_qty - update.filled_qty).abs() < 1e-12
        {
            return Some(record.clone());
        }

        // Fill quantity never shrinks.
        record.filled_qty = record.filled_qty.max(update.filled_qty);
        record.status = update.status;
        record.updated_time = update.updated_time;

        info!(
            order_id = %record.order_id,
            status = %record.status,
            filled = record.filled_qty,
            "order state reconciled"
        );

        let snapshot = record.clone();
        drop(orders);
        self.persist(&snapshot);
        Some(snapshot)
    }

    /// Apply an execution fill. Returns false when the fill was already seen
    /// (deduplicated by exec_id in the store).
    pub fn apply_execution(&self, fill: &ExecutionFill) -> bool {
        let fresh = match self.store.insert_execution(
            &fill.exec_id,
            &fill.order_id,
            &fill.symbol,
            &fill.side.to_string(),
            fill.qty,
            fill.price,
            fill.exec_time,
        ) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(exec_id = %fill.exec_id, error = %e, "failed to record execution");
                return false;
            }
        };

        if !fresh {
            debug!(exec_id = %fill.exec_id, "duplicate fill notice — ignored");
            return false;
        }

        let mut orders = self.orders.write();
        if let Some(record) = orders.get_mut(&fill.order_id) {
            if !record.status.is_terminal() {
                record.filled_qty = (record.filled_qty + fill.qty).min(record.qty);
                record.status = if record.filled_qty >= record.qty - 1e-12 {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                record.updated_time = fill.exec_time;
                let snapshot = record.clone();
                drop(orders);
                self.persist(&snapshot);
            }
        }
        true
    }

    pub fn get_order(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.read().get(order_id).cloned()
    }

    pub fn open_orders(&self, symbol: Option<&str>) -> Vec<OrderRecord> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal() && symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect()
    }
}
