// =============================================================================
// Private WebSocket client — order / execution / position topics
// =============================================================================
//
// One connection authenticated with a signed `op=auth` message:
//   args = [api_key, expires_ms, hmac_sha256(secret, "GET/realtime" + expires_ms)]
//
// Parsed events flow into a bounded channel consumed by the owning loop. On
// reconnect the supervising task calls this again, which re-auths and
// re-subscribes.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::execution::order_manager::{OrderStatus, OrderUpdate};
use crate::execution::ExecutionFill;
use crate::types::{Environment, PositionSide, Side};

use super::client::{ws_auth_signature, BybitRestClient};

const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Auth expiry margin past "now".
const AUTH_EXPIRES_MS: u64 = 10_000;

/// Parsed private-channel event.
#[derive(Debug, Clone)]
pub enum PrivateEvent {
    Order(OrderUpdate),
    Execution(ExecutionFill),
    Position {
        symbol: String,
        side: Option<PositionSide>,
        qty: f64,
        entry_price: f64,
    },
}

/// Connect, authenticate, subscribe, and pump events into `sender`. Returns
/// on disconnect so the supervising task can reconnect (and thereby re-auth
/// and re-subscribe).
pub async fn run_private_stream(
    environment: Environment,
    api_key: &str,
    api_secret: &str,
    sender: mpsc::Sender<PrivateEvent>,
) -> Result<()> {
    let url = environment.private_ws_url();
    info!(url, "connecting private WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect private WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    // Authenticate.
    let expires = BybitRestClient::timestamp_ms() + AUTH_EXPIRES_MS;
    let signature = ws_auth_signature(api_secret, expires);
    let auth = serde_json::json!({
        "op": "auth",
        "args": [api_key, expires, signature],
    });
    write
        .send(Message::Text(auth.to_string()))
        .await
        .context("failed to send auth frame")?;

    // Subscribe to the private topics.
    let subscribe = serde_json::json!({
        "op": "subscribe",
        "args": ["order", "execution", "position"],
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send subscribe frame")?;
    info!("private WebSocket authenticated and subscribed");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let frame = serde_json::json!({ "op": "ping" });
                if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                    error!(error = %e, "private ping failed — reconnecting");
                    return Err(e.into());
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        for event in parse_private_message(&text) {
                            if sender.send(event).await.is_err() {
                                warn!("private event receiver dropped — stopping stream");
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "private WebSocket read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!("private WebSocket stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Parse one private frame into zero or more events.
pub fn parse_private_message(text: &str) -> Vec<PrivateEvent> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable private WS frame");
            return Vec::new();
        }
    };

    // Auth/subscribe acks carry "op" and no topic.
    let topic = match root["topic"].as_str() {
        Some(t) => t,
        None => {
            if root["op"].as_str() == Some("auth") && root["success"].as_bool() != Some(true) {
                warn!(frame = %root, "private WebSocket auth rejected");
            }
            return Vec::new();
        }
    };

    let data = match root["data"].as_array() {
        Some(d) => d,
        None => return Vec::new(),
    };

    let mut events = Vec::new();
    match topic {
        "order" => {
            for entry in data {
                let status = entry["orderStatus"]
                    .as_str()
                    .and_then(OrderStatus::parse);
                let status = match status {
                    Some(s) => s,
                    None => {
                        debug!(status = ?entry["orderStatus"], "unmapped order status");
                        continue;
                    }
                };
                events.push(PrivateEvent::Order(OrderUpdate {
                    order_id: entry["orderId"].as_str().unwrap_or_default().to_string(),
                    status,
                    filled_qty: str_f64(&entry["cumExecQty"]),
                    updated_time: str_i64(&entry["updatedTime"]),
                }));
            }
        }
        "execution" => {
            for entry in data {
                let side = match entry["side"].as_str() {
                    Some("Buy") => Side::Buy,
                    Some("Sell") => Side::Sell,
                    _ => continue,
                };
                events.push(PrivateEvent::Execution(ExecutionFill {
                    exec_id: entry["execId"].as_str().unwrap_or_default().to_string(),
                    order_id: entry["orderId"].as_str().unwrap_or_default().to_string(),
                    symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                    side,
                    qty: str_f64(&entry["execQty"]),
                    price: str_f64(&entry["execPrice"]),
                    exec_time: str_i64(&entry["execTime"]),
                }));
            }
        }
        "position" => {
            for entry in data {
                let side = match entry["side"].as_str() {
                    Some("Buy") => Some(PositionSide::Long),
                    Some("Sell") => Some(PositionSide::Short),
                    _ => None, // flat
                };
                events.push(PrivateEvent::Position {
                    symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                    side,
                    qty: str_f64(&entry["size"]),
                    entry_price: str_f64(&entry["avgPrice"]),
                });
            }
        }
        _ => {}
    }

    events
}

fn str_f64(val: &serde_json::Value) -> f64 {
    match val {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn str_i64(val: &serde_json::Value) -> i64 {
    match val {
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_order_update() {
        let json = r#"{
            "topic": "order",
            "data": [{
                "orderId": "abc-1",
                "orderStatus": "PartiallyFilled",
                "cumExecQty": "0.4",
                "updatedTime": "1700000001000",
                "symbol": "BTCUSDT"
            }]
        }"#;
        let events = parse_private_message(json);
        assert_eq!(events.len(), 1);
        match &events[0] {
            PrivateEvent::Order(update) => {
                assert_eq!(update.order_id, "abc-1");
                assert_eq!(update.status, OrderStatus::PartiallyFilled);
                assert!((update.filled_qty - 0.4).abs() < 1e-12);
                assert_eq!(update.updated_time, 1_700_000_001_000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parse_execution_fill() {
        let json = r#"{
            "topic": "execution",
            "data": [{
                "execId": "e-9",
                "orderId": "abc-1",
                "symbol": "ETHUSDT",
                "side": "Sell",
                "execQty": "2.5",
                "execPrice": "3000.5",
                "execTime": "1700000002000"
            }]
        }"#;
        let events = parse_private_message(json);
        match &events[0] {
            PrivateEvent::Execution(fill) => {
                assert_eq!(fill.exec_id, "e-9");
                assert_eq!(fill.side, Side::Sell);
                assert!((fill.price - 3000.5).abs() < 1e-12);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parse_position_update_including_flat() {
        let json = r#"{
            "topic": "position",
            "data": [
                { "symbol": "BTCUSDT", "side": "Buy", "size": "1.5", "avgPrice": "50000" },
                { "symbol": "ETHUSDT", "side": "", "size": "0", "avgPrice": "0" }
            ]
        }"#;
        let events = parse_private_message(json);
        assert_eq!(events.len(), 2);
        match &events[0] {
            PrivateEvent::Position { side, qty, .. } => {
                assert_eq!(*side, Some(PositionSide::Long));
                assert_eq!(*qty, 1.5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[1] {
            PrivateEvent::Position { side, qty, .. } => {
                assert_eq!(*side, None);
                assert_eq!(*qty, 0.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn acks_produce_no_events() {
        assert!(parse_private_message(r#"{"op":"auth","success":true}"#).is_empty());
        assert!(parse_private_message(r#"{"op":"subscribe","success":true}"#).is_empty());
    }

    #[test]
    fn unknown_order_status_skipped() {
        let json = r#"{
            "topic": "order",
            "data": [{ "orderId": "x", "orderStatus": "Untriggered", "cumExecQty": "0" }]
        }"#;
        assert!(parse_private_message(json).is_empty());
    }
}
