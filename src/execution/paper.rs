// =============================================================================
// Paper gateway — in-process simulator fed by live market data
// =============================================================================
//
// Market orders fill at the last known price for the symbol (falling back to
// the request's reference price before the first tick). Limit orders and
// virtual SL/TP resolve against incoming ticks via `on_tick`.
//
// Fill arithmetic is shared with the backtest gateway, so both backends
// produce the same observable results for the same call script and reference
// prices.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

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
    last_prices: HashMap<String, f64>,
}

pub struct PaperGateway {
    halt: HaltFlag,
    inner: Mutex<Inner>,
    exec_counter: AtomicU64,
}

impl PaperGateway {
    pub fn new(initial_balance: f64, halt: HaltFlag) -> Self {
        info!(initial_balance, "paper gateway initialised");
        Self {
            halt,
            inner: Mutex::new(Inner {
                balance: initial_balance,
                positions: HashMap::new(),
                pending: Vec::new(),
                executions: Vec::new(),
                last_prices: HashMap::new(),
            }),
            exec_counter: AtomicU64::new(0),
        }
    }

    fn record_fill(
        &self,
        inner: &mut Inner,
        order_id: &str,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) {
        let n = self.exec_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let realized = apply_fill(&mut inner.positions, symbol, side, qty, price);
        inner.balance += realized;
        inner.executions.push(ExecutionFill {
            exec_id: format!("paper_exec_{n}"),
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            exec_time: Utc::now().timestamp_millis(),
        });
    }

    /// Feed one market tick: records the last price, resolves resting limit
    /// orders, refreshes PnL, and enforces virtual stops.
    pub fn on_tick(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.lock();
        inner.last_prices.insert(symbol.to_string(), price);

        // Resolve resting limits.
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
            self.record_fill(
                &mut inner,
                &order_id,
                &request.symbol,
                request.side,
                request.qty,
                request.price.unwrap_or(price),
            );
        }

        // Virtual SL/TP.
        let trigger = inner
            .positions
            .get_mut(symbol)
            .and_then(|pos| update_sim_pnl(pos, price));
        if let Some(close_side) = trigger {
            let qty = inner.positions.get(symbol).map(|p| p.qty).unwrap_or(0.0);
            if qty > 0.0 {
                let order_id = format!("paper_stop_{}", Uuid::new_v4());
                debug!(symbol, price, "paper virtual stop triggered");
                self.record_fill(&mut inner, &order_id, symbol, close_side, qty, price);
            }
        }
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.inner.lock().last_prices.get(symbol).copied()
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn place_order(&self, request: OrderRequest) -> OrderResult {
        if self.halt.is_halted() {
            return OrderResult::halted();
        }
        if request.qty <= 0.0 {
            return OrderResult::err("qty must be positive");
        }

        let order_id = format!("paper_{}", Uuid::new_v4());
        let mut inner = self.inner.lock();

        match request.order_type {
            OrderType::Market => {
                let price = inner
                    .last_prices
                    .get(&request.symbol)
                    .copied()
                    .or(request.price);
                let price = match price {
                    Some(p) if p > 0.0 => p,
                    _ => return OrderResult::err("no known price for market order"),
                };
                self.record_fill(
                    &mut inner,
                    &order_id,
                    &request.symbol,
                    request.side,
                    request.qty,
                    price,
                );
                debug!(order_id = %order_id, symbol = %request.symbol, price, "paper market fill");
                OrderResult::ok(Some(order_id), serde_json::json!({ "exec_price": price }))
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

    fn gateway() -> PaperGateway {
        PaperGateway::new(10_000.0, HaltFlag::new(false))
    }

    #[tokio::test]
    async fn market_order_uses_last_known_price() {
        let gw = gateway();
        gw.on_tick("BTCUSDT", 50_123.0);
        let result = gw.place_order(OrderRequest::market("BTCUSDT", Side::Buy, 0.5)).await;
        assert!(result.success);
        let pos = gw.get_position("BTCUSDT").await.unwrap();
        assert_eq!(pos.entry_price, 50_123.0);
    }

    #[tokio::test]
    async fn market_order_before_first_tick_uses_reference() {
        let gw = gateway();
        let result = gw
            .place_order(OrderRequest::market("BTCUSDT", Side::Buy, 0.5).reference_price(100.0))
            .await;
        assert!(result.success);
        assert_eq!(gw.get_position("BTCUSDT").await.unwrap().entry_price, 100.0);
    }

    #[tokio::test]
    async fn limit_order_resolves_on_tick() {
        let gw = gateway();
        gw.on_tick("BTCUSDT", 100.0);
        gw.place_order(OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 95.0)).await;
        assert!(gw.get_position("BTCUSDT").await.is_none());

        gw.on_tick("BTCUSDT", 94.0);
        let pos = gw.get_position("BTCUSDT").await.unwrap();
        assert_eq!(pos.entry_price, 95.0);
    }

    #[tokio::test]
    async fn tick_updates_unrealized_and_triggers_stops() {
        let gw = gateway();
        gw.on_tick("BTCUSDT", 100.0);
        gw.place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0)).await;
        gw.set_trading_stop(
            "BTCUSDT",
            Some(95.0),
            None,
            TriggerBy::LastPrice,
            TriggerBy::LastPrice,
        )
        .await;

        gw.on_tick("BTCUSDT", 98.0);
        let pos = gw.get_position("BTCUSDT").await.unwrap();
        assert!((pos.unrealized_pnl + 2.0).abs() < 1e-9);

        gw.on_tick("BTCUSDT", 94.0);
        assert!(gw.get_position("BTCUSDT").await.is_none());
        let balance = gw.get_account_balance("UNIFIED").await.unwrap();
        assert!((balance.balance - 9_994.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn halted_flag_blocks_placement() {
        let halt = HaltFlag::new(true);
        let gw = PaperGateway::new(10_000.0, halt);
        let result = gw
            .place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0).reference_price(100.0))
            .await;
        assert_eq!(result.error.as_deref(), Some("halted"));
    }
}
