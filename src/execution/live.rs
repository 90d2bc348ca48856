// =============================================================================
// Live gateway — forwards to the order manager and the venue's signed REST API
// =============================================================================
//
// The halt flag is checked before every placement; order submissions are
// tracked by the order manager so the lifecycle can be reconciled against
// private WebSocket updates.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::exchange::BybitRestClient;

use super::{
    AccountBalance, ExecutionFill, ExecutionGateway, HaltFlag, OpenOrderInfo, OrderManager,
    OrderRequest, OrderResult, PositionInfo, TriggerBy,
};

pub struct LiveGateway {
    client: Arc<BybitRestClient>,
    orders: Arc<OrderManager>,
    halt: HaltFlag,
}

impl LiveGateway {
    pub fn new(client: Arc<BybitRestClient>, orders: Arc<OrderManager>, halt: HaltFlag) -> Self {
        Self {
            client,
            orders,
            halt,
        }
    }
}

#[async_trait]
impl ExecutionGateway for LiveGateway {
    async fn place_order(&self, request: OrderRequest) -> OrderResult {
        if self.halt.is_halted() {
            return OrderResult::halted();
        }

        // A client link id makes the submission idempotent venue-side.
        let mut request = request;
        if request.order_link_id.is_none() {
            request.order_link_id = Some(Uuid::new_v4().to_string());
        }

        match self.client.place_order(&request).await {
            Ok(response) => {
                let result = OrderResult::from_api_response(response);
                if let Some(order_id) = &result.order_id {
                    self.orders.track_new_order(
                        order_id,
                        request.order_link_id.clone(),
                        &request.symbol,
                        request.side,
                        request.order_type,
                        request.qty,
                        request.price,
                        request.time_in_force,
                    );
                }
                result
            }
            Err(e) => {
                warn!(symbol = %request.symbol, error = %e, "live order placement failed");
                OrderResult::err(e.to_string())
            }
        }
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        order_link_id: Option<&str>,
    ) -> OrderResult {
        match self.client.cancel_order(symbol, order_id, order_link_id).await {
            Ok(response) => OrderResult::from_api_response(response),
            Err(e) => OrderResult::err(e.to_string()),
        }
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> OrderResult {
        match self.client.cancel_all_orders(symbol).await {
            Ok(response) => OrderResult::from_api_response(response),
            Err(e) => OrderResult::err(e.to_string()),
        }
    }

    async fn get_position(&self, symbol: &str) -> Option<PositionInfo> {
        match self.client.get_positions().await {
            Ok(positions) => positions.into_iter().find(|p| p.symbol == symbol),
            Err(e) => {
                warn!(symbol, error = %e, "get_position failed");
                None
            }
        }
    }

    async fn get_positions(&self) -> Vec<PositionInfo> {
        match self.client.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "get_positions failed");
                Vec::new()
            }
        }
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrderInfo> {
        match self.client.get_open_orders(symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "get_open_orders failed");
                Vec::new()
            }
        }
    }

    async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        sl_trigger: TriggerBy,
        tp_trigger: TriggerBy,
    ) -> OrderResult {
        match self
            .client
            .set_trading_stop(symbol, stop_loss, take_profit, sl_trigger, tp_trigger)
            .await
        {
            Ok(response) => OrderResult::from_api_response(response),
            Err(e) => OrderResult::err(e.to_string()),
        }
    }

    async fn cancel_trading_stop(&self, symbol: &str) -> OrderResult {
        // Clearing both stops server-side uses the same endpoint with "0".
        match self
            .client
            .set_trading_stop(symbol, None, None, TriggerBy::LastPrice, TriggerBy::LastPrice)
            .await
        {
            Ok(response) => OrderResult::from_api_response(response),
            Err(e) => OrderResult::err(e.to_string()),
        }
    }

    async fn get_account_balance(&self, account_type: &str) -> anyhow::Result<AccountBalance> {
        self.client
            .get_wallet_balance(account_type)
            .await
            .map_err(anyhow::Error::from)
    }

    async fn get_executions(&self, symbol: Option<&str>, limit: usize) -> Vec<ExecutionFill> {
        match self.client.get_executions(symbol, limit).await {
            Ok(fills) => fills,
            Err(e) => {
                warn!(error = %e, "get_executions failed");
                Vec::new()
            }
        }
    }
}
