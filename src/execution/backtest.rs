// =============================================================================
// Backtest gateway — pure deterministic simulator
// =============================================================================
//
// Internal balance, positions map, pending orders, and an execution log.
// Market orders fill instantly at the caller-provided reference price; limit
// orders rest until `resolve_pending`. Virtual SL/TP are tracked locally and
// triggered by caller-driven `update_position_pnl(symbol, price)` hooks.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::types::{OrderType, Side};

use super::{
    apply_fill, update_sim_pnl, AccountBalance, ExecutionFill, ExecutionGateway, HaltFlag,
    OpenOrderInfo, OrderRequest, OrderResult, PositionInfo, SimPosition, TriggerBy,
};

struct PendingOrder {
    order_id: String,
    request: OrderRequest,
    status: &'static str,
}

struct Inner {
    balance: f64,
    positions: HashMap<String, SimPosition>,
    pending: Vec<PendingOrder>,
    executions: Vec<ExecutionFill>,
}

pub struct BacktestGateway {
    halt: HaltFlag,
    inner: Mutex<Inner>,
    order_counter: AtomicU64,
}

impl BacktestGateway {
    pub fn new(initial_balance: f64, halt: HaltFlag) -> Self {
        Self {
            halt,
            inner: Mutex::new(Inner {
                balance: initial_balance,
                positions: HashMap::new(),
                pending: Vec::new(),
                executions: Vec::new(),
            }),
            order_counter: AtomicU64::new(0),
        }
    }

    fn next_order_id(&self) -> String {
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("backtest_{n}")
    }

    fn record_fill(inner: &mut Inner, order_id: &str, symbol: &str, side: Side, qty: f64, price: f64) {
        let exec_id = format!("exec_{}", inner.executions.len() + 1);
        let realized = apply_fill(&mut inner.positions, symbol, side, qty, price);
        inner.balance += realized;
        inner.executions.push(ExecutionFill {
            exec_id,
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            exec_time: 0,
        });
    }

    /// Update the simulated mark for one symbol; triggers virtual SL/TP.
    pub fn update_position_pnl(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.lock();
        let trigger = match inner.positions.get_mut(symbol) {
            Some(pos) => update_sim_pnl(pos, price),
            None => return,
        };

        if let Some(close_side) = trigger {
            let qty = inner.positions.get(symbol).map(|p| p.qty).unwrap_or(0.0);
            if qty > 0.0 {
                let order_id = {
                    let n = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    format!("backtest_{n}")
                };
                debug!(symbol, price, "virtual stop triggered — closing position");
                Self::record_fill(&mut inner, &order_id, symbol, close_side, qty, price);
            }
        }
    }

    /// Resolve resting limit orders against a reference price.
    pub fn resolve_pending(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.lock();
        let mut fills: Vec<(String, OrderRequest)> = Vec::new();

        for order in inner.pending.iter_mut() {
            if order.status != "New" || order.request.symbol != symbol {
                continue;
            }
            let limit = match order.request.price {
                Some(p) => p,
                None => continue,
            };
            let crossed = match order.request.side {
                Side::Buy => price <= limit,
                Side::Sell => price >= limit,
            };
            if crossed {
                order.status = "Filled";
                fills.push((order.order_id.clone(), order.request.clone()));
            }
        }

        for (order_id, request) in fills {
            Self::record_fill(
                &mut inner,
                &order_id,
                &request.symbol,
                request.side,
                request.qty,
                request.price.unwrap_or(price),
            );
        }
    }
}

#[async_trait]
impl ExecutionGateway for BacktestGateway {
    async fn place_order(&self, request: OrderRequest) -> OrderResult {
        if self.halt.is_halted() {
            return OrderResult::halted();
        }
        if request.qty <= 0.0 {
            return OrderResult::err("qty must be positive");
        }

        let order_id = self.next_order_id();
        let mut inner = self.inner.lock();

        match request.order_type {
            OrderType::Market => {
                let price = match request.price {
                    Some(p) if p > 0.0 => p,
                    _ => return OrderResult::err("market order needs a reference price"),
                };
                Self::record_fill(
                    &mut inner,
                    &order_id,
                    &request.symbol,
                    request.side,
                    request.qty,
                    price,
                );
                debug!(order_id = %order_id, symbol = %request.symbol, price, "backtest market fill");
                OrderResult::ok(
                    Some(order_id),
                    serde_json::json!({ "exec_price": price }),
                )
            }
            OrderType::Limit => {
                if request.price.is_none() {
                    return OrderResult::err("limit order requires a price");
                }
                inner.pending.push(PendingOrder {
                    order_id: order_id.clone(),
                    request,
                    status: "New",
                });
                OrderResult::ok(Some(order_id), serde_json::json!({ "status": "New" }))
            }
        }
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: Option<&str>,
        order_link_id: Option<&str>,
    ) -> OrderResult {
        let mut inner = self.inner.lock();
        let found = inner.pending.iter_mut().find(|o| {
            (order_id.is_some() && Some(o.order_id.as_str()) == order_id)
                || (order_link_id.is_some()
                    && o.request.order_link_id.as_deref() == order_link_id)
        });
        match found {
            Some(order) if order.status == "New" => {
                order.status = "Cancelled";
                OrderResult::ok(None, serde_json::json!({ "cancelled": true }))
            }
            _ => OrderResult::err("order not found"),
        }
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> OrderResult {
        let mut inner = self.inner.lock();
        let mut cancelled = 0;
        for order in inner.pending.iter_mut() {
            if order.status == "New" && symbol.map_or(true, |s| order.request.symbol == s) {
                order.status = "Cancelled";
                cancelled += 1;
            }
        }
        OrderResult::ok(None, serde_json::json!({ "cancelled_count": cancelled }))
    }

    async fn get_position(&self, symbol: &str) -> Option<PositionInfo> {
        self.inner.lock().positions.get(symbol).map(|p| p.to_info())
    }

    async fn get_positions(&self) -> Vec<PositionInfo> {
        let mut out: Vec<PositionInfo> =
            self.inner.lock().positions.values().map(|p| p.to_info()).collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrderInfo> {
        self.inner
            .lock()
            .pending
            .iter()
            .filter(|o| o.status == "New" && symbol.map_or(true, |s| o.request.symbol == s))
            .map(|o| OpenOrderInfo {
                order_id: o.order_id.clone(),
                order_link_id: o.request.order_link_id.clone(),
                symbol: o.request.symbol.clone(),
                side: o.request.side,
                order_type: o.request.order_type,
                qty: o.request.qty,
                price: o.request.price,
                status: o.status.to_string(),
            })
            .collect()
    }

    async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        _sl_trigger: TriggerBy,
        _tp_trigger: TriggerBy,
    ) -> OrderResult {
        let mut inner = self.inner.lock();
        match inner.positions.get_mut(symbol) {
            Some(pos) => {
                pos.stop_loss = stop_loss;
                pos.take_profit = take_profit;
                OrderResult::ok(
                    None,
                    serde_json::json!({
                        "stop_loss": stop_loss,
                        "take_profit": take_profit,
                        "mode": "virtual"
                    }),
                )
            }
            None => OrderResult::err("no position"),
        }
    }

    async fn cancel_trading_stop(&self, symbol: &str) -> OrderResult {
        let mut inner = self.inner.lock();
        match inner.positions.get_mut(symbol) {
            Some(pos) => {
                pos.stop_loss = None;
                pos.take_profit = None;
                OrderResult::ok(None, serde_json::json!({ "cancelled": true }))
            }
            None => OrderResult::err("no position"),
        }
    }

    async fn get_account_balance(&self, _account_type: &str) -> anyhow::Result<AccountBalance> {
        let inner = self.inner.lock();
        let unrealized: f64 = inner.positions.values().map(|p| p.unrealized_pnl).sum();
        Ok(AccountBalance {
            balance: inner.balance,
            unrealized_pnl: unrealized,
            equity: inner.balance + unrealized,
        })
    }

    async fn get_executions(&self, symbol: Option<&str>, limit: usize) -> Vec<ExecutionFill> {
        let inner = self.inner.lock();
        let filtered: Vec<ExecutionFill> = inner
            .executions
            .iter()
            .filter(|e| symbol.map_or(true, |s| e.symbol == s))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> BacktestGateway {
        BacktestGateway::new(10_000.0, HaltFlag::new(false))
    }

    #[tokio::test]
    async fn market_order_fills_instantly() {
        let gw = gateway();
        let result = gw
            .place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0).reference_price(100.0))
            .await;
        assert!(result.success);
        let pos = gw.get_position("BTCUSDT").await.unwrap();
        assert_eq!(pos.qty, 1.0);
        assert_eq!(pos.entry_price, 100.0);
        assert_eq!(gw.get_executions(None, 10).await.len(), 1);
    }

    #[tokio::test]
    async fn market_order_without_reference_price_fails() {
        let gw = gateway();
        let result = gw.place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0)).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn limit_order_rests_until_crossed() {
        let gw = gateway();
        let result = gw
            .place_order(OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 95.0))
            .await;
        assert!(result.success);
        assert!(gw.get_position("BTCUSDT").await.is_none());
        assert_eq!(gw.get_open_orders(Some("BTCUSDT")).await.len(), 1);

        gw.resolve_pending("BTCUSDT", 96.0); // not crossed
        assert!(gw.get_position("BTCUSDT").await.is_none());

        gw.resolve_pending("BTCUSDT", 94.0); // crossed, fills at the limit
        let pos = gw.get_position("BTCUSDT").await.unwrap();
        assert_eq!(pos.entry_price, 95.0);
        assert!(gw.get_open_orders(Some("BTCUSDT")).await.is_empty());
    }

    #[tokio::test]
    async fn close_realises_pnl_into_balance() {
        let gw = gateway();
        gw.place_order(OrderRequest::market("BTCUSDT", Side::Buy, 2.0).reference_price(100.0))
            .await;
        gw.place_order(
            OrderRequest::market("BTCUSDT", Side::Sell, 2.0)
                .reference_price(110.0)
                .reduce_only(),
        )
        .await;

        assert!(gw.get_position("BTCUSDT").await.is_none());
        let balance = gw.get_account_balance("UNIFIED").await.unwrap();
        assert!((balance.balance - 10_020.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn virtual_stop_closes_position() {
        let gw = gateway();
        gw.place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0).reference_price(100.0))
            .await;
        let r = gw
            .set_trading_stop(
                "BTCUSDT",
                Some(95.0),
                Some(110.0),
                TriggerBy::LastPrice,
                TriggerBy::LastPrice,
            )
            .await;
        assert!(r.success);

        gw.update_position_pnl("BTCUSDT", 97.0);
        assert!(gw.get_position("BTCUSDT").await.is_some());

        gw.update_position_pnl("BTCUSDT", 94.5);
        assert!(gw.get_position("BTCUSDT").await.is_none());

        let balance = gw.get_account_balance("UNIFIED").await.unwrap();
        assert!((balance.balance - (10_000.0 - 5.5)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cancel_all_scoped_by_symbol() {
        let gw = gateway();
        gw.place_order(OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 95.0)).await;
        gw.place_order(OrderRequest::limit("ETHUSDT", Side::Buy, 1.0, 2900.0)).await;

        gw.cancel_all_orders(Some("BTCUSDT")).await;
        assert!(gw.get_open_orders(Some("BTCUSDT")).await.is_empty());
        assert_eq!(gw.get_open_orders(Some("ETHUSDT")).await.len(), 1);

        gw.cancel_all_orders(None).await;
        assert!(gw.get_open_orders(None).await.is_empty());
    }

    #[tokio::test]
    async fn halted_flag_blocks_placement() {
        let halt = HaltFlag::new(false);
        let gw = BacktestGateway::new(10_000.0, halt.clone());
        halt.set(true);
        let result = gw
            .place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0).reference_price(100.0))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("halted"));
    }
}
