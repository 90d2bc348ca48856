// =============================================================================
// Bybit V5 REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret is never logged or serialized. Private calls carry
// X-BAPI-API-KEY / X-BAPI-TIMESTAMP / X-BAPI-SIGN / X-BAPI-RECV-WINDOW /
// X-BAPI-SIGN-TYPE headers.
//
// The signed string is `timestamp + api_key + recv_window + payload`, where
// the payload is the URL-encoded query string for GET and the EXACT compact
// JSON body for POST. The same byte string must be transmitted and signed —
// any whitespace difference invalidates the signature.
// =============================================================================

use anyhow::Context;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::execution::{AccountBalance, ExecutionFill, OpenOrderInfo, OrderRequest, PositionInfo, TriggerBy};
use crate::features::DerivativesSnapshot;
use crate::market_data::{Candle, OrderbookSnapshot};
use crate::types::{Environment, OrderType, PositionSide, Side};

use super::retry::{ret_code_error, with_retry, DEFAULT_MAX_ATTEMPTS};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: &str = "5000";

/// Linear perpetuals category used for every request.
const CATEGORY: &str = "linear";

/// Bybit V5 REST client with request signing and retry classification.
#[derive(Clone)]
pub struct BybitRestClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BybitRestClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, environment: Environment) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(environment = %environment, "BybitRestClient initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: environment.rest_base_url().to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`.
    pub fn sign_payload(&self, timestamp: &str, payload: &str) -> String {
        let message = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build a sorted URL-encoded query string.
    pub fn build_query(params: &[(&str, String)]) -> String {
        let mut sorted: Vec<(&str, &str)> =
            params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn private_headers(&self, timestamp: &str, signature: &str) -> Vec<(&'static str, String)> {
        vec![
            ("X-BAPI-API-KEY", self.api_key.clone()),
            ("X-BAPI-TIMESTAMP", timestamp.to_string()),
            ("X-BAPI-SIGN", signature.to_string()),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
            ("X-BAPI-SIGN-TYPE", "2".to_string()),
        ]
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn get_once(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<serde_json::Value, EngineError> {
        let query = Self::build_query(params);
        let url = if query.is_empty() {
            format!("{}{endpoint}", self.base_url)
        } else {
            format!("{}{endpoint}?{query}", self.base_url)
        };

        let mut request = self.client.get(&url);
        if signed {
            let timestamp = Self::timestamp_ms().to_string();
            let signature = self.sign_payload(&timestamp, &query);
            for (name, value) in self.private_headers(&timestamp, &signature) {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("GET {endpoint}: {e}")))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("GET {endpoint} parse: {e}")))?;

        Self::check_ret_code(endpoint, body)
    }

    async fn post_once(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        // The exact byte string that is signed must be transmitted.
        let payload = serde_json::to_string(body)
            .map_err(|e| EngineError::Integrity(format!("POST {endpoint} serialise: {e}")))?;
        let timestamp = Self::timestamp_ms().to_string();
        let signature = self.sign_payload(&timestamp, &payload);

        let url = format!("{}{endpoint}", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload);
        for (name, value) in self.private_headers(&timestamp, &signature) {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("POST {endpoint}: {e}")))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("POST {endpoint} parse: {e}")))?;

        Self::check_ret_code(endpoint, body)
    }

    fn check_ret_code(
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        let ret_code = body.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
        if ret_code == 0 {
            return Ok(body);
        }
        let message = body
            .get("retMsg")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        warn!(endpoint, ret_code, message, "venue returned error");
        Err(ret_code_error(ret_code, message))
    }

    async fn get_json(
        &self,
        endpoint: &str,
        params: Vec<(&'static str, String)>,
        signed: bool,
    ) -> Result<serde_json::Value, EngineError> {
        with_retry(endpoint, DEFAULT_MAX_ATTEMPTS, || {
            self.get_once(endpoint, &params, signed)
        })
        .await
    }

    async fn post_json(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        with_retry(endpoint, DEFAULT_MAX_ATTEMPTS, || self.post_once(endpoint, &body)).await
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /v5/market/time.
    pub async fn get_server_time(&self) -> Result<i64, EngineError> {
        let body = self.get_json("/v5/market/time", vec![], false).await?;
        body["result"]["timeSecond"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| EngineError::Network("missing timeSecond".into()))
    }

    /// GET /v5/market/kline. Bybit returns newest-first; the result here is
    /// oldest-first with the forming bar last.
    pub async fn get_kline(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let params = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self.get_json("/v5/market/kline", params, false).await?;

        let list = body["result"]["list"]
            .as_array()
            .ok_or_else(|| EngineError::Network("kline list missing".into()))?;

        let mut candles = Vec::with_capacity(list.len());
        for entry in list.iter().rev() {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!(symbol, "skipping malformed kline entry");
                    continue;
                }
            };
            candles.push(Candle {
                start_time: parse_str_i64(&arr[0]).unwrap_or(0),
                open: parse_str_f64(&arr[1]).unwrap_or(f64::NAN),
                high: parse_str_f64(&arr[2]).unwrap_or(f64::NAN),
                low: parse_str_f64(&arr[3]).unwrap_or(f64::NAN),
                close: parse_str_f64(&arr[4]).unwrap_or(f64::NAN),
                volume: parse_str_f64(&arr[5]).unwrap_or(0.0),
                turnover: arr.get(6).and_then(|v| parse_str_f64(v)).unwrap_or(0.0),
                confirmed: true,
            });
        }

        // The most recent bar is the forming one.
        if let Some(last) = candles.last_mut() {
            last.confirmed = false;
        }

        debug!(symbol, interval, count = candles.len(), "kline fetched");
        Ok(candles)
    }

    /// GET /v5/market/orderbook.
    pub async fn get_orderbook(
        &self,
        symbol: &str,
        depth: u32,
    ) -> Result<OrderbookSnapshot, EngineError> {
        let params = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
            ("limit", depth.to_string()),
        ];
        let body = self.get_json("/v5/market/orderbook", params, false).await?;

        let parse_side = |key: &str| -> Vec<(f64, f64)> {
            body["result"][key]
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let arr = row.as_array()?;
                            Some((parse_str_f64(arr.first()?)?, parse_str_f64(arr.get(1)?)?))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderbookSnapshot {
            bids: parse_side("b"),
            asks: parse_side("a"),
            update_id: body["result"]["u"].as_u64().unwrap_or(0),
        })
    }

    /// GET /v5/market/tickers + /v5/market/open-interest, combined into the
    /// derivatives snapshot (mark/index/funding/OI and OI change).
    pub async fn get_derivatives_snapshot(
        &self,
        symbol: &str,
    ) -> Result<DerivativesSnapshot, EngineError> {
        let params = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
        ];
        let body = self.get_json("/v5/market/tickers", params, false).await?;
        let ticker = body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| EngineError::Network("ticker list empty".into()))?;

        let mut snapshot = DerivativesSnapshot {
            mark_price: field_f64(ticker, "markPrice"),
            index_price: field_f64(ticker, "indexPrice"),
            funding_rate: field_f64(ticker, "fundingRate"),
            open_interest: field_f64(ticker, "openInterest"),
            oi_change: 0.0,
        };

        // OI change from the two most recent 5-minute points; best-effort.
        let oi_params = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
            ("intervalTime", "5min".to_string()),
            ("limit", "2".to_string()),
        ];
        if let Ok(oi_body) = self.get_json("/v5/market/open-interest", oi_params, false).await {
            if let Some(list) = oi_body["result"]["list"].as_array() {
                if list.len() >= 2 {
                    let newest = field_f64(&list[0], "openInterest");
                    let prev = field_f64(&list[1], "openInterest");
                    snapshot.oi_change = newest - prev;
                }
            }
        }

        Ok(snapshot)
    }

    /// GET /v5/market/instruments-info.
    pub async fn get_instruments_info(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, EngineError> {
        let mut params = vec![("category", CATEGORY.to_string())];
        if let Some(s) = symbol {
            params.push(("symbol", s.to_string()));
        }
        let body = self
            .get_json("/v5/market/instruments-info", params, false)
            .await?;
        Ok(body["result"]["list"].as_array().cloned().unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Account / positions
    // -------------------------------------------------------------------------

    /// GET /v5/account/wallet-balance (signed).
    pub async fn get_wallet_balance(
        &self,
        account_type: &str,
    ) -> Result<AccountBalance, EngineError> {
        let params = vec![("accountType", account_type.to_string())];
        let body = self
            .get_json("/v5/account/wallet-balance", params, true)
            .await?;

        let account = body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| EngineError::Network("wallet-balance list empty".into()))?;

        let equity = field_f64(account, "totalEquity");
        let unrealized = field_f64(account, "totalPerpUPL");
        Ok(AccountBalance {
            balance: equity - unrealized,
            unrealized_pnl: unrealized,
            equity,
        })
    }

    /// GET /v5/position/list (signed).
    pub async fn get_positions(&self) -> Result<Vec<PositionInfo>, EngineError> {
        let params = vec![
            ("category", CATEGORY.to_string()),
            ("settleCoin", "USDT".to_string()),
        ];
        let body = self.get_json("/v5/position/list", params, true).await?;

        let mut positions = Vec::new();
        if let Some(list) = body["result"]["list"].as_array() {
            for entry in list {
                let qty = field_f64(entry, "size");
                if qty <= 0.0 {
                    continue;
                }
                let side = match entry["side"].as_str() {
                    Some("Buy") => PositionSide::Long,
                    Some("Sell") => PositionSide::Short,
                    _ => continue,
                };
                positions.push(PositionInfo {
                    symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                    side,
                    qty,
                    entry_price: field_f64(entry, "avgPrice"),
                    unrealized_pnl: field_f64(entry, "unrealisedPnl"),
                });
            }
        }
        Ok(positions)
    }

    /// GET /v5/order/realtime (signed).
    pub async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OpenOrderInfo>, EngineError> {
        let mut params = vec![
            ("category", CATEGORY.to_string()),
            ("settleCoin", "USDT".to_string()),
        ];
        if let Some(s) = symbol {
            params.push(("symbol", s.to_string()));
        }
        let body = self.get_json("/v5/order/realtime", params, true).await?;

        let mut orders = Vec::new();
        if let Some(list) = body["result"]["list"].as_array() {
            for entry in list {
                let side = match entry["side"].as_str() {
                    Some("Buy") => Side::Buy,
                    Some("Sell") => Side::Sell,
                    _ => continue,
                };
                let order_type = match entry["orderType"].as_str() {
                    Some("Limit") => OrderType::Limit,
                    _ => OrderType::Market,
                };
                orders.push(OpenOrderInfo {
                    order_id: entry["orderId"].as_str().unwrap_or_default().to_string(),
                    order_link_id: entry["orderLinkId"]
                        .as_str()
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string()),
                    symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                    side,
                    order_type,
                    qty: field_f64(entry, "qty"),
                    price: Some(field_f64(entry, "price")).filter(|p| *p > 0.0),
                    status: entry["orderStatus"].as_str().unwrap_or_default().to_string(),
                });
            }
        }
        Ok(orders)
    }

    /// GET /v5/execution/list (signed).
    pub async fn get_executions(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionFill>, EngineError> {
        let mut params = vec![
            ("category", CATEGORY.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(s) = symbol {
            params.push(("symbol", s.to_string()));
        }
        let body = self.get_json("/v5/execution/list", params, true).await?;

        let mut fills = Vec::new();
        if let Some(list) = body["result"]["list"].as_array() {
            for entry in list {
                let side = match entry["side"].as_str() {
                    Some("Buy") => Side::Buy,
                    Some("Sell") => Side::Sell,
                    _ => continue,
                };
                fills.push(ExecutionFill {
                    exec_id: entry["execId"].as_str().unwrap_or_default().to_string(),
                    order_id: entry["orderId"].as_str().unwrap_or_default().to_string(),
                    symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                    side,
                    qty: field_f64(entry, "execQty"),
                    price: field_f64(entry, "execPrice"),
                    exec_time: entry["execTime"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                });
            }
        }
        Ok(fills)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /v5/order/create (signed).
    pub async fn place_order(&self, request: &OrderRequest) -> Result<serde_json::Value, EngineError> {
        let mut body = serde_json::json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "side": request.side.to_string(),
            "orderType": request.order_type.to_string(),
            "qty": format_number(request.qty),
            "timeInForce": request.time_in_force.to_string(),
        });
        if let Some(price) = request.price {
            if request.order_type == OrderType::Limit {
                body["price"] = serde_json::Value::String(format_number(price));
            }
        }
        if let Some(link_id) = &request.order_link_id {
            body["orderLinkId"] = serde_json::Value::String(link_id.clone());
        }
        if request.reduce_only {
            body["reduceOnly"] = serde_json::Value::Bool(true);
        }

        self.post_json("/v5/order/create", body).await
    }

    /// POST /v5/order/cancel (signed).
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<&str>,
        order_link_id: Option<&str>,
    ) -> Result<serde_json::Value, EngineError> {
        let mut body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
        });
        if let Some(id) = order_id {
            body["orderId"] = serde_json::Value::String(id.to_string());
        }
        if let Some(link) = order_link_id {
            body["orderLinkId"] = serde_json::Value::String(link.to_string());
        }
        self.post_json("/v5/order/cancel", body).await
    }

    /// POST /v5/order/cancel-all (signed).
    pub async fn cancel_all_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<serde_json::Value, EngineError> {
        let mut body = serde_json::json!({ "category": CATEGORY });
        match symbol {
            Some(s) => body["symbol"] = serde_json::Value::String(s.to_string()),
            None => body["settleCoin"] = serde_json::Value::String("USDT".to_string()),
        }
        self.post_json("/v5/order/cancel-all", body).await
    }

    /// POST /v5/position/set-leverage (signed).
    pub async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), EngineError> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": format_number(leverage),
            "sellLeverage": format_number(leverage),
        });
        self.post_json("/v5/position/set-leverage", body).await?;
        Ok(())
    }

    /// POST /v5/position/trading-stop (signed).
    pub async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        sl_trigger: TriggerBy,
        tp_trigger: TriggerBy,
    ) -> Result<serde_json::Value, EngineError> {
        let mut body = serde_json::json!({
            "category": CATEGORY,
            "symbol": symbol,
            "positionIdx": 0,
            "slTriggerBy": sl_trigger.to_string(),
            "tpTriggerBy": tp_trigger.to_string(),
        });
        // An explicit "0" clears the venue-side stop.
        body["stopLoss"] =
            serde_json::Value::String(stop_loss.map(format_number).unwrap_or_else(|| "0".into()));
        body["takeProfit"] =
            serde_json::Value::String(take_profit.map(format_number).unwrap_or_else(|| "0".into()));

        self.post_json("/v5/position/trading-stop", body).await
    }
}

impl std::fmt::Debug for BybitRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitRestClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -------------------------------------------------------------------------
// Parse helpers — Bybit sends most numbers as strings
// -------------------------------------------------------------------------

fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_str_i64(val: &serde_json::Value) -> Option<i64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn field_f64(obj: &serde_json::Value, key: &str) -> f64 {
    obj.get(key).and_then(parse_str_f64).unwrap_or(0.0)
}

/// Format a quantity/price for the wire without scientific notation or a
/// trailing dot.
pub fn format_number(value: f64) -> String {
    let mut s = format!("{value:.10}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

/// Signature helper exposed for the private WebSocket auth message:
/// hmac_sha256(secret, "GET/realtime" + expires_ms).
pub fn ws_auth_signature(secret: &str, expires_ms: u64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("GET/realtime{expires_ms}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Convenience: anyhow adapter for startup paths where the taxonomy does not
/// matter.
pub fn to_anyhow<T>(result: Result<T, EngineError>, what: &str) -> anyhow::Result<T> {
    result.map_err(anyhow::Error::from).context(what.to_string())
}
