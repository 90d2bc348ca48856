// =============================================================================
// Kill switch — atomic emergency halt of all trading
// =============================================================================
//
// activate():
//   1. no-op when already halted
//   2. cancel all open orders for the listed symbols (or every known symbol)
//   3. close each open position with a reduce-only IOC market order
//   4. record cancellations and closures in history
//   5. set the halt flag, bump the activation counter, persist
//      trading_disabled=true
//
// While halted, every gateway refuses placements with error "halted". Only an
// explicit reset() clears the in-memory flag, the persisted flag, AND the
// legacy errors-table halt row, so a single reset truly re-enables trading.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::storage::{SqliteStore, TRADING_DISABLED_FLAG};
use crate::types::OrderType;

use super::{ExecutionGateway, OrderRequest};

/// Last-resort symbol universe when neither configuration nor the store knows
/// any symbols.
const FALLBACK_SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"];

// ---------------------------------------------------------------------------
// HaltFlag — the single process-wide atomic toggle
// ---------------------------------------------------------------------------

/// Shared halt flag checked by every gateway before accepting an order. The
/// check is racy-safe: a stale read only costs one extra rejected order.
#[derive(Clone)]
pub struct HaltFlag(Arc<AtomicBool>);

impl HaltFlag {
    pub fn new(halted: bool) -> Self {
        Self(Arc::new(AtomicBool::new(halted)))
    }

    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, halted: bool) {
        self.0.store(halted, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Activation records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledOrderRecord {
    pub symbol: String,
    pub order_id: String,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPositionRecord {
    pub symbol: String,
    pub original_side: String,
    pub close_side: String,
    pub qty: f64,
    pub order_id: Option<String>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub symbols: Option<Vec<String>>,
    pub orders_cancelled: usize,
    pub positions_closed: usize,
    pub errors: Vec<String>,
    pub success: bool,
}

/// Result returned by `activate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationReport {
    pub success: bool,
    pub already_halted: bool,
    pub timestamp: DateTime<Utc>,
    pub orders_cancelled: usize,
    pub positions_closed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchStatus {
    pub halted: bool,
    pub halted_at: Option<DateTime<Utc>>,
    pub activation_count: u32,
    pub orders_cancelled: usize,
    pub positions_closed: usize,
}

#[derive(Default)]
struct Inner {
    halted_at: Option<DateTime<Utc>>,
    activation_count: u32,
    history: Vec<ActivationRecord>,
    cancelled_orders: Vec<CancelledOrderRecord>,
    closed_positions: Vec<ClosedPositionRecord>,
}

// ---------------------------------------------------------------------------
// KillSwitchManager
// ---------------------------------------------------------------------------

pub struct KillSwitchManager {
    gateway: Arc<dyn ExecutionGateway>,
    store: SqliteStore,
    halt: HaltFlag,
    configured_symbols: Vec<String>,
    inner: Mutex<Inner>,
}

impl KillSwitchManager {
    pub fn new(
        gateway: Arc<dyn ExecutionGateway>,
        store: SqliteStore,
        halt: HaltFlag,
        configured_symbols: Vec<String>,
    ) -> Self {
        Self {
            gateway,
            store,
            halt,
            configured_symbols,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn halt_flag(&self) -> HaltFlag {
        self.halt.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    /// Emergency shutdown. Synchronous in effect: all cancellations and
    /// closures are attempted before this returns. Per-operation errors are
    /// collected but never prevent the transition to HALTED.
    pub async fn activate(
        &self,
        reason: &str,
        symbols: Option<Vec<String>>,
        cancel_orders: bool,
        close_positions: bool,
    ) -> ActivationReport {
        if self.halt.is_halted() {
            warn!("kill switch already halted, skipping activation");
            return ActivationReport {
                success: false,
                already_halted: true,
                timestamp: Utc::now(),
                orders_cancelled: 0,
                positions_closed: 0,
                errors: vec!["already halted".to_string()],
            };
        }

        let activation_time = Utc::now();
        let mut errors: Vec<String> = Vec::new();

        error!(
            reason,
            symbols = ?symbols,
            "KILL SWITCH ACTIVATED"
        );

        let universe = self.symbol_universe(symbols.as_deref());

        // Step 1: cancel all pending orders.
        let mut cancelled = 0usize;
        if cancel_orders {
            cancelled = self.cancel_all(&universe, &mut errors).await;
        }

        // Step 2: close all open positions.
        let mut closed = 0usize;
        if close_positions {
            closed = self.close_all(symbols.as_deref(), &mut errors).await;
        }

        // Step 3: halt.
        self.halt.set(true);
        if let Err(e) = self.store.set_flag(TRADING_DISABLED_FLAG, "true") {
            errors.push(format!("failed to persist trading_disabled: {e}"));
        }

        let success = errors.is_empty();
        {
            let mut inner = self.inner.lock();
            inner.halted_at = Some(activation_time);
            inner.activation_count += 1;
            inner.history.push(ActivationRecord {
                timestamp: activation_time,
                reason: reason.to_string(),
                symbols,
                orders_cancelled: cancelled,
                positions_closed: closed,
                errors: errors.clone(),
                success,
            });
        }

        error!(
            orders_cancelled = cancelled,
            positions_closed = closed,
            errors = errors.len(),
            "kill switch halt complete"
        );

        ActivationReport {
            success,
            already_halted: false,
            timestamp: activation_time,
            orders_cancelled: cancelled,
            positions_closed: closed,
            errors,
        }
    }

    /// Re-enable trading: clears the in-memory flag, the persisted flag, and
    /// the legacy errors-table halt indicator.
    pub fn reset(&self) -> anyhow::Result<()> {
        self.halt.set(false);
        self.store.set_flag(TRADING_DISABLED_FLAG, "false")?;
        self.store.clear_legacy_halt()?;
        let mut inner = self.inner.lock();
        inner.halted_at = None;
        info!("kill switch reset — trading re-enabled");
        Ok(())
    }

    pub fn status(&self) -> KillSwitchStatus {
        let inner = self.inner.lock();
        KillSwitchStatus {
            halted: self.halt.is_halted(),
            halted_at: inner.halted_at,
            activation_count: inner.activation_count,
            orders_cancelled: inner.cancelled_orders.len(),
            positions_closed: inner.closed_positions.len(),
        }
    }

    pub fn history(&self) -> Vec<ActivationRecord> {
        self.inner.lock().history.clone()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Union of the caller's list, the configured set, and symbols with open
    /// positions in the store; the constant list is a last resort.
    fn symbol_universe(&self, symbols: Option<&[String]>) -> Vec<String> {
        if let Some(list) = symbols {
            if !list.is_empty() {
                return list.to_vec();
            }
        }

        let mut universe: Vec<String> = self.configured_symbols.clone();
        if let Ok(positions) = self.store.positions() {
            for p in positions {
                if !universe.contains(&p.symbol) {
                    universe.push(p.symbol);
                }
            }
        }
        if universe.is_empty() {
            universe = FALLBACK_SYMBOLS.iter().map(|s| s.to_string()).collect();
        }
        universe
    }

    async fn cancel_all(&self, universe: &[String], errors: &mut Vec<String>) -> usize {
        let mut cancelled = 0usize;
        for symbol in universe {
            let open = self.gateway.get_open_orders(Some(symbol.as_str())).await;
            let result = self.gateway.cancel_all_orders(Some(symbol.as_str())).await;
            if result.success {
                let mut inner = self.inner.lock();
                for order in &open {
                    warn!(symbol = %symbol, order_id = %order.order_id, "kill switch cancelled order");
                    inner.cancelled_orders.push(CancelledOrderRecord {
                        symbol: symbol.clone(),
                        order_id: order.order_id.clone(),
                        cancelled_at: Utc::now(),
                    });
                }
                cancelled += open.len();
            } else {
                errors.push(format!(
                    "cancel_all failed for {symbol}: {}",
                    result.error.unwrap_or_default()
                ));
            }
        }
        cancelled
    }

    async fn close_all(&self, symbols: Option<&[String]>, errors: &mut Vec<String>) -> usize {
        let positions = self.gateway.get_positions().await;
        let mut closed = 0usize;

        for position in positions {
            if let Some(filter) = symbols {
                if !filter.is_empty() && !filter.contains(&position.symbol) {
                    continue;
                }
            }
            if position.qty <= 0.0 {
                continue;
            }

            let close_side = position.side.close_side();
            let request = OrderRequest {
                symbol: position.symbol.clone(),
                side: close_side,
                order_type: OrderType::Market,
                qty: position.qty,
                price: Some(position.entry_price),
                time_in_force: crate::types::TimeInForce::Ioc,
                order_link_id: None,
                reduce_only: true,
            };

            let result = self.gateway.place_order(request).await;
            if result.success {
                warn!(
                    symbol = %position.symbol,
                    side = %position.side,
                    qty = position.qty,
                    "kill switch closed position"
                );
                self.inner.lock().closed_positions.push(ClosedPositionRecord {
                    symbol: position.symbol.clone(),
                    original_side: position.side.to_string(),
                    close_side: close_side.to_string(),
                    qty: position.qty,
                    order_id: result.order_id,
                    closed_at: Utc::now(),
                });
                closed += 1;
            } else {
                errors.push(format!(
                    "close failed for {}: {}",
                    position.symbol,
                    result.error.unwrap_or_default()
                ));
            }
        }
        closed
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{BacktestGateway, ExecutionGateway, OrderRequest};
    use crate::types::Side;

    fn setup() -> (tempfile::TempDir, Arc<BacktestGateway>, KillSwitchManager, HaltFlag) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ks.db")).unwrap();
        let halt = HaltFlag::new(false);
        let gateway = Arc::new(BacktestGateway::new(100_000.0, halt.clone()));
        let manager = KillSwitchManager::new(
            gateway.clone(),
            store,
            halt.clone(),
            vec!["BTCUSDT".into(), "ETHUSDT".into()],
        );
        (dir, gateway, manager, halt)
    }

    #[tokio::test]
    async fn activation_cancels_closes_and_halts() {
        let (_dir, gateway, manager, halt) = setup();

        // Two open positions and a pending order.
        gateway
            .place_order(OrderRequest::market("BTCUSDT", Side::Buy, 2.0).reference_price(50_000.0))
            .await;
        gateway
            .place_order(OrderRequest::market("ETHUSDT", Side::Sell, 15.0).reference_price(3_000.0))
            .await;
        gateway
            .place_order(OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 45_000.0))
            .await;

        let report = manager
            .activate("equity_drop_20pct", None, true, true)
            .await;

        assert!(report.success, "errors: {:?}", report.errors);
        assert!(!report.already_halted);
        assert_eq!(report.orders_cancelled, 1);
        assert_eq!(report.positions_closed, 2);
        assert!(halt.is_halted());

        // All positions flat, all orders gone.
        assert!(gateway.get_positions().await.is_empty());
        assert!(gateway.get_open_orders(None).await.is_empty());

        // Further placements refused.
        let refused = gateway
            .place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0).reference_price(50_000.0))
            .await;
        assert_eq!(refused.error.as_deref(), Some("halted"));
    }

    #[tokio::test]
    async fn second_activation_is_noop() {
        let (_dir, _gateway, manager, _halt) = setup();
        manager.activate("first", None, true, true).await;
        let second = manager.activate("second", None, true, true).await;
        assert!(second.already_halted);
        assert_eq!(manager.status().activation_count, 1);
    }

    #[tokio::test]
    async fn reset_clears_all_indicators_and_reenables() {
        let (dir, gateway, manager, halt) = setup();
        let store = SqliteStore::open(dir.path().join("ks.db")).unwrap();
        // Simulate the legacy indicator being present too.
        store.write_legacy_halt("old halt").unwrap();

        manager.activate("test", None, true, true).await;
        assert!(store.trading_disabled().unwrap());

        manager.reset().unwrap();
        assert!(!halt.is_halted());
        assert!(!store.trading_disabled().unwrap());
        assert!(!store.legacy_halt_present().unwrap());

        // Trading resumes.
        let ok = gateway
            .place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0).reference_price(50_000.0))
            .await;
        assert!(ok.success);
    }

    #[tokio::test]
    async fn history_records_each_activation() {
        let (_dir, gateway, manager, _halt) = setup();
        gateway
            .place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0).reference_price(100.0))
            .await;
        manager.activate("r1", Some(vec!["BTCUSDT".into()]), true, true).await;

        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "r1");
        assert_eq!(history[0].positions_closed, 1);
        assert_eq!(manager.status().positions_closed, 1);
    }
}
