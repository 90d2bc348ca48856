// =============================================================================
// Public WebSocket client — kline and orderbook channels
// =============================================================================
//
// Subscribes to `kline.{interval}.{symbol}` and `orderbook.{depth}.{symbol}`.
// The orderbook channel delivers one `snapshot` frame followed by `delta`
// frames; deltas before a snapshot are dropped by the local book, and a size
// of 0 removes the level. The client pings every 20 seconds.
//
// Runs until the stream disconnects or an error occurs, then returns so the
// supervising task can reconnect and re-subscribe.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::{Candle, CandleBuffer, CandleKey, OrderBookManager};
use crate::types::Environment;

/// Heartbeat interval; the venue requires a ping at most every 20 s.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Parsed public-channel update.
#[derive(Debug)]
pub enum PublicEvent {
    Kline {
        key: CandleKey,
        candle: Candle,
    },
    OrderbookSnapshot {
        symbol: String,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
        update_id: u64,
    },
    OrderbookDelta {
        symbol: String,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
        update_id: u64,
    },
}

/// Connect, subscribe, and pump events into the shared buffers. Returns on
/// disconnect so the caller can loop-reconnect.
pub async fn run_public_stream(
    environment: Environment,
    symbols: &[String],
    intervals: &[String],
    depth: u32,
    candles: &Arc<CandleBuffer>,
    books: &Arc<OrderBookManager>,
) -> Result<()> {
    let url = environment.public_ws_url();
    info!(url, "connecting public WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect public WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    // Subscribe to all channels in one frame.
    let mut args: Vec<String> = Vec::new();
    for symbol in symbols {
        for interval in intervals {
            args.push(format!("kline.{interval}.{symbol}"));
        }
        args.push(format!("orderbook.{depth}.{symbol}"));
    }
    let channel_count = args.len();
    let subscribe = serde_json::json!({ "op": "subscribe", "args": args });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send subscribe frame")?;
    info!(channels = channel_count, "public WebSocket subscribed");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let frame = serde_json::json!({ "op": "ping" });
                if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                    error!(error = %e, "ping failed — reconnecting");
                    return Err(e.into());
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        for event in parse_public_message(&text) {
                            apply_public_event(event, candles, books);
                        }
                    }
                    Some(Ok(_)) => {} // ping/pong/binary frames
                    Some(Err(e)) => {
                        error!(error = %e, "public WebSocket read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!("public WebSocket stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn apply_public_event(event: PublicEvent, candles: &Arc<CandleBuffer>, books: &Arc<OrderBookManager>) {
    match event {
        PublicEvent::Kline { key, candle } => {
            debug!(key = %key, close = candle.close, confirmed = candle.confirmed, "candle update");
            candles.update(key, candle);
        }
        PublicEvent::OrderbookSnapshot {
            symbol,
            bids,
            asks,
            update_id,
        } => {
            books.apply_snapshot(
                &symbol,
                &crate::market_data::OrderbookSnapshot {
                    bids,
                    asks,
                    update_id,
                },
            );
        }
        PublicEvent::OrderbookDelta {
            symbol,
            bids,
            asks,
            update_id,
        } => {
            books.apply_delta(&symbol, &bids, &asks, update_id);
        }
    }
}

/// Parse one public-channel frame into zero or more events.
pub fn parse_public_message(text: &str) -> Vec<PublicEvent> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable public WS frame");
            return Vec::new();
        }
    };

    let topic = match root["topic"].as_str() {
        Some(t) => t,
        None => return Vec::new(), // op acks, pong frames
    };

    if let Some(rest) = topic.strip_prefix("kline.") {
        let mut parts = rest.splitn(2, '.');
        let interval = parts.next().unwrap_or_default().to_string();
        let symbol = parts.next().unwrap_or_default().to_string();
        if symbol.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();
        if let Some(list) = root["data"].as_array() {
            for entry in list {
                let candle = Candle {
                    start_time: parse_i64(&entry["start"]),
                    open: parse_f64(&entry["open"]),
                    high: parse_f64(&entry["high"]),
                    low: parse_f64(&entry["low"]),
                    close: parse_f64(&entry["close"]),
                    volume: parse_f64(&entry["volume"]),
                    turnover: parse_f64(&entry["turnover"]),
                    confirmed: entry["confirm"].as_bool().unwrap_or(false),
                };
                events.push(PublicEvent::Kline {
                    key: CandleKey {
                        symbol: symbol.clone(),
                        interval: interval.clone(),
                    },
                    candle,
                });
            }
        }
        return events;
    }

    if topic.starts_with("orderbook.") {
        let data = &root["data"];
        let symbol = data["s"].as_str().unwrap_or_default().to_string();
        if symbol.is_empty() {
            return Vec::new();
        }
        let bids = parse_levels(&data["b"]);
        let asks = parse_levels(&data["a"]);
        let update_id = data["u"].as_u64().unwrap_or(0);

        let event = match root["type"].as_str() {
            Some("snapshot") => PublicEvent::OrderbookSnapshot {
                symbol,
                bids,
                asks,
                update_id,
            },
            Some("delta") => PublicEvent::OrderbookDelta {
                symbol,
                bids,
                asks,
                update_id,
            },
            _ => return Vec::new(),
        };
        return vec![event];
    }

    Vec::new()
}

fn parse_levels(val: &serde_json::Value) -> Vec<(f64, f64)> {
    val.as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let arr = row.as_array()?;
                    Some((parse_f64_opt(arr.first()?)?, parse_f64_opt(arr.get(1)?)?))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_f64(val: &serde_json::Value) -> f64 {
    parse_f64_opt(val).unwrap_or(f64::NAN)
}

fn parse_f64_opt(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_i64(val: &serde_json::Value) -> i64 {
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
    fn parse_kline_frame() {
        let json = r#"{
            "topic": "kline.1.BTCUSDT",
            "type": "snapshot",
            "data": [{
                "start": 1700000000000,
                "end": 1700000059999,
                "interval": "1",
                "open": "37000.0",
                "high": "37050.5",
                "low": "36990.1",
                "close": "37020.2",
                "volume": "123.456",
                "turnover": "4567890.12",
                "confirm": false
            }]
        }"#;
        let events = parse_public_message(json);
        assert_eq!(events.len(), 1);
        match &events[0] {
            PublicEvent::Kline { key, candle } => {
                assert_eq!(key.symbol, "BTCUSDT");
                assert_eq!(key.interval, "1");
                assert!((candle.close - 37020.2).abs() < 1e-9);
                assert!(!candle.confirmed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parse_orderbook_snapshot_then_delta() {
        let snapshot = r#"{
            "topic": "orderbook.50.BTCUSDT",
            "type": "snapshot",
            "data": {
                "s": "BTCUSDT",
                "b": [["37000.0", "1.5"], ["36999.9", "2.0"]],
                "a": [["37000.1", "1.0"]],
                "u": 100
            }
        }"#;
        let events = parse_public_message(snapshot);
        assert!(matches!(events[0], PublicEvent::OrderbookSnapshot { .. }));

        let delta = r#"{
            "topic": "orderbook.50.BTCUSDT",
            "type": "delta",
            "data": {
                "s": "BTCUSDT",
                "b": [["37000.0", "0"]],
                "a": [],
                "u": 101
            }
        }"#;
        let events = parse_public_message(delta);
        match &events[0] {
            PublicEvent::OrderbookDelta { bids, update_id, .. } => {
                assert_eq!(bids[0], (37_000.0, 0.0));
                assert_eq!(*update_id, 101);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn non_topic_frames_are_ignored() {
        assert!(parse_public_message(r#"{"op":"pong"}"#).is_empty());
        assert!(parse_public_message(r#"{"success":true,"op":"subscribe"}"#).is_empty());
        assert!(parse_public_message("not json").is_empty());
    }
}
