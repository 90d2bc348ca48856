// =============================================================================
// Execution gateway — one abstract contract, three backends
// =============================================================================
//
// Live forwards to the order manager and the venue's signed REST API; Paper
// simulates in-process against last known prices; Backtest is a pure
// deterministic simulator. All three produce identical externally observable
// results for the same script of calls and the same reference prices.
// =============================================================================

pub mod backtest;
pub mod kill_switch;
pub mod live;
pub mod order_manager;
pub mod paper;
pub mod position_manager;
pub mod scaled_entry;
pub mod signal_action;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{OrderType, PositionSide, Side, TimeInForce};

pub use backtest::BacktestGateway;
pub use kill_switch::{HaltFlag, KillSwitchManager};
pub use live::LiveGateway;
pub use order_manager::OrderManager;
pub use paper::PaperGateway;
pub use position_manager::{ManagedPosition, PositionManager};
pub use scaled_entry::{EntryLevel, ScaledEntryManager, TriggerCondition};
pub use signal_action::{decide_action, SignalDecision};

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

/// Price type a conditional stop triggers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerBy {
    LastPrice,
    MarkPrice,
    IndexPrice,
}

impl std::fmt::Display for TriggerBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LastPrice => write!(f, "LastPrice"),
            Self::MarkPrice => write!(f, "MarkPrice"),
            Self::IndexPrice => write!(f, "IndexPrice"),
        }
    }
}

/// A fully specified order submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub order_link_id: Option<String>,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, qty: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            time_in_force: TimeInForce::Ioc,
            order_link_id: None,
            reduce_only: false,
        }
    }

    pub fn limit(symbol: &str, side: Side, qty: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            time_in_force: TimeInForce::Gtc,
            order_link_id: None,
            reduce_only: false,
        }
    }

    pub fn reference_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn link_id(mut self, id: &str) -> Self {
        self.order_link_id = Some(id.to_string());
        self
    }
}

/// Uniform outcome of every gateway operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl OrderResult {
    pub fn ok(order_id: Option<String>, raw: serde_json::Value) -> Self {
        Self {
            success: true,
            order_id,
            error: None,
            raw,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error: Some(error.into()),
            raw: serde_json::Value::Null,
        }
    }

    /// The fixed refusal while the kill switch is halted.
    pub fn halted() -> Self {
        Self::err("halted")
    }

    /// Parse a Bybit V5 response envelope (`retCode == 0` is success).
    pub fn from_api_response(response: serde_json::Value) -> Self {
        let ret_code = response.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
        let success = ret_code == 0;
        let order_id = response
            .get("result")
            .and_then(|r| r.get("orderId"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let error = if success {
            None
        } else {
            Some(
                response
                    .get("retMsg")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            )
        };
        Self {
            success,
            order_id,
            error,
            raw: response,
        }
    }
}

/// Open position as a gateway reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// Open order as a gateway reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrderInfo {
    pub order_id: String,
    pub order_link_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountBalance {
    pub balance: f64,
    pub unrealized_pnl: f64,
    pub equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFill {
    pub exec_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub exec_time: i64,
}

// ---------------------------------------------------------------------------
// The gateway contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn place_order(&self, request: OrderRequest) -> OrderResult;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        order_link_id: Option<&str>,
    ) -> OrderResult;

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> OrderResult;

    async fn get_position(&self, symbol: &str) -> Option<PositionInfo>;

    async fn get_positions(&self) -> Vec<PositionInfo>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrderInfo>;

    async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        sl_trigger: TriggerBy,
        tp_trigger: TriggerBy,
    ) -> OrderResult;

    async fn cancel_trading_stop(&self, symbol: &str) -> OrderResult;

    async fn get_account_balance(&self, account_type: &str) -> anyhow::Result<AccountBalance>;

    async fn get_executions(&self, symbol: Option<&str>, limit: usize) -> Vec<ExecutionFill>;
}

// ---------------------------------------------------------------------------
// Shared simulator fill semantics (paper + backtest)
// ---------------------------------------------------------------------------

/// Simulated position held by the paper and backtest backends. Both backends
/// share the fill arithmetic below so their observable behaviour cannot
/// diverge.
#[derive(Debug, Clone)]
pub(crate) struct SimPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub unrealized_pnl: f64,
}

impl SimPosition {
    pub fn to_info(&self) -> PositionInfo {
        PositionInfo {
            symbol: self.symbol.clone(),
            side: self.side,
            qty: self.qty,
            entry_price: self.entry_price,
            unrealized_pnl: self.unrealized_pnl,
        }
    }
}

/// Quantities below this are treated as a fully closed position.
pub(crate) const QTY_DUST: f64 = 1e-9;

/// Apply a fill to the position table; returns realized PnL.
///
/// Same-direction fills update a size-weighted entry; opposite-direction
/// fills reduce, close, or flip the position with PnL realised on the closed
/// quantity.
pub(crate) fn apply_fill(
    positions: &mut HashMap<String, SimPosition>,
    symbol: &str,
    side: Side,
    qty: f64,
    price: f64,
) -> f64 {
    let fill_side = match side {
        Side::Buy => PositionSide::Long,
        Side::Sell => PositionSide::Short,
    };

    let existing = positions.remove(symbol);
    match existing {
        None => {
            positions.insert(
                symbol.to_string(),
                SimPosition {
                    symbol: symbol.to_string(),
                    side: fill_side,
                    qty,
                    entry_price: price,
                    stop_loss: None,
                    take_profit: None,
                    unrealized_pnl: 0.0,
                },
            );
            0.0
        }
        Some(mut pos) if pos.side == fill_side => {
            let total = pos.qty + qty;
            pos.entry_price = (pos.entry_price * pos.qty + price * qty) / total;
            pos.qty = total;
            positions.insert(symbol.to_string(), pos);
            0.0
        }
        Some(mut pos) => {
            // Opposite direction: reduce / close / flip.
            let closed_qty = pos.qty.min(qty);
            let direction = match pos.side {
                PositionSide::Long => 1.0,
                PositionSide::Short => -1.0,
            };
            let realized = (price - pos.entry_price) * closed_qty * direction;

            let remainder = qty - pos.qty;
            if remainder > QTY_DUST {
                // Flip into the opposite side with the leftover quantity.
                positions.insert(
                    symbol.to_string(),
                    SimPosition {
                        symbol: symbol.to_string(),
                        side: fill_side,
                        qty: remainder,
                        entry_price: price,
                        stop_loss: None,
                        take_profit: None,
                        unrealized_pnl: 0.0,
                    },
                );
            } else if pos.qty - qty > QTY_DUST {
                pos.qty -= qty;
                positions.insert(symbol.to_string(), pos);
            }
            // Exactly closed: position stays removed.
            realized
        }
    }
}

/// Refresh unrealized PnL and report a triggered virtual stop, if any.
pub(crate) fn update_sim_pnl(pos: &mut SimPosition, price: f64) -> Option<Side> {
    let direction = match pos.side {
        PositionSide::Long => 1.0,
        PositionSide::Short => -1.0,
    };
    pos.unrealized_pnl = (price - pos.entry_price) * pos.qty * direction;

    match pos.side {
        PositionSide::Long => {
            if pos.stop_loss.map_or(false, |sl| price <= sl)
                || pos.take_profit.map_or(false, |tp| price >= tp)
            {
                return Some(Side::Sell);
            }
        }
        PositionSide::Short => {
            if pos.stop_loss.map_or(false, |sl| price >= sl)
                || pos.take_profit.map_or(false, |tp| price <= tp)
            {
                return Some(Side::Buy);
            }
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_opens_position() {
        let mut positions = HashMap::new();
        let pnl = apply_fill(&mut positions, "BTCUSDT", Side::Buy, 1.0, 100.0);
        assert_eq!(pnl, 0.0);
        let pos = positions.get("BTCUSDT").unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.qty, 1.0);
    }

    #[test]
    fn same_side_fill_weights_entry() {
        let mut positions = HashMap::new();
        apply_fill(&mut positions, "BTCUSDT", Side::Buy, 1.0, 100.0);
        apply_fill(&mut positions, "BTCUSDT", Side::Buy, 1.0, 110.0);
        let pos = positions.get("BTCUSDT").unwrap();
        assert_eq!(pos.qty, 2.0);
        assert!((pos.entry_price - 105.0).abs() < 1e-12);
    }

    #[test]
    fn opposite_fill_reduces_and_realises() {
        let mut positions = HashMap::new();
        apply_fill(&mut positions, "BTCUSDT", Side::Buy, 2.0, 100.0);
        let pnl = apply_fill(&mut positions, "BTCUSDT", Side::Sell, 1.0, 110.0);
        assert!((pnl - 10.0).abs() < 1e-12);
        assert_eq!(positions.get("BTCUSDT").unwrap().qty, 1.0);
    }

    #[test]
    fn exact_close_removes_position() {
        let mut positions = HashMap::new();
        apply_fill(&mut positions, "BTCUSDT", Side::Buy, 2.0, 100.0);
        let pnl = apply_fill(&mut positions, "BTCUSDT", Side::Sell, 2.0, 90.0);
        assert!((pnl + 20.0).abs() < 1e-12);
        assert!(positions.is_empty());
    }

    #[test]
    fn oversized_opposite_fill_flips() {
        let mut positions = HashMap::new();
        apply_fill(&mut positions, "BTCUSDT", Side::Buy, 1.0, 100.0);
        let pnl = apply_fill(&mut positions, "BTCUSDT", Side::Sell, 3.0, 110.0);
        assert!((pnl - 10.0).abs() < 1e-12);
        let pos = positions.get("BTCUSDT").unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        assert!((pos.qty - 2.0).abs() < 1e-12);
        assert!((pos.entry_price - 110.0).abs() < 1e-12);
    }

    #[test]
    fn short_pnl_sign() {
        let mut positions = HashMap::new();
        apply_fill(&mut positions, "ETHUSDT", Side::Sell, 10.0, 3000.0);
        let pnl = apply_fill(&mut positions, "ETHUSDT", Side::Buy, 10.0, 2900.0);
        assert!((pnl - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn virtual_stop_triggers() {
        let mut pos = SimPosition {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            qty: 1.0,
            entry_price: 100.0,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            unrealized_pnl: 0.0,
        };
        assert_eq!(update_sim_pnl(&mut pos, 100.0), None);
        assert_eq!(update_sim_pnl(&mut pos, 94.0), Some(Side::Sell));
        assert_eq!(update_sim_pnl(&mut pos, 111.0), Some(Side::Sell));

        let mut short = SimPosition {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Short,
            qty: 1.0,
            entry_price: 100.0,
            stop_loss: Some(105.0),
            take_profit: Some(90.0),
            unrealized_pnl: 0.0,
        };
        assert_eq!(update_sim_pnl(&mut short, 106.0), Some(Side::Buy));
        assert_eq!(update_sim_pnl(&mut short, 89.0), Some(Side::Buy));
    }

    #[test]
    fn api_response_parsing() {
        let ok = OrderResult::from_api_response(serde_json::json!({
            "retCode": 0,
            "result": { "orderId": "abc-123" }
        }));
        assert!(ok.success);
        assert_eq!(ok.order_id.as_deref(), Some("abc-123"));

        let err = OrderResult::from_api_response(serde_json::json!({
            "retCode": 110007,
            "retMsg": "insufficient margin"
        }));
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("insufficient margin"));
    }

    #[test]
    fn halted_result_shape() {
        let r = OrderResult::halted();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("halted"));
    }
}
