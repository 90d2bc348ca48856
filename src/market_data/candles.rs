// =============================================================================
// OHLCV candles and the per-(symbol, interval) ring buffer
// =============================================================================
//
// Frame invariants enforced by `validate_frame`:
//   - strictly increasing start timestamps
//   - low <= min(open, close), high >= max(open, close)
//   - volume >= 0
//
// The last bar of a fetched frame is the forming (open) bar; decision code
// must drop it and act on confirmed bars only.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, milliseconds since epoch.
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub turnover: f64,
    /// Whether the bar's window has fully elapsed.
    pub confirmed: bool,
}

impl Candle {
    pub fn new(start_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            start_time,
            open,
            high,
            low,
            close,
            volume,
            turnover: 0.0,
            confirmed: true,
        }
    }

    /// Candle body size.
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_wick(&self) -> f64 {
        self.open.min(self.close) - self.low
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// Frame validation
// ---------------------------------------------------------------------------

/// Check the OHLCV frame invariants. Returns the first violation found.
pub fn validate_frame(bars: &[Candle]) -> Result<(), String> {
    for (i, bar) in bars.iter().enumerate() {
        if i > 0 && bar.start_time <= bars[i - 1].start_time {
            return Err(format!(
                "non-increasing timestamps at index {i}: {} <= {}",
                bar.start_time,
                bars[i - 1].start_time
            ));
        }
        if bar.low > bar.open.min(bar.close) {
            return Err(format!("low above body at index {i}"));
        }
        if bar.high < bar.open.max(bar.close) {
            return Err(format!("high below body at index {i}"));
        }
        if bar.volume < 0.0 {
            return Err(format!("negative volume at index {i}"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer per (symbol, interval)
// ---------------------------------------------------------------------------

/// Thread-safe ring buffer that stores the most recent candles per
/// `(symbol, interval)` pair.  The forming candle is continuously updated
/// in-place; when it confirms it becomes permanent and the ring is trimmed to
/// `max_candles`.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Insert or replace the latest candle for the given key.
    ///
    /// A confirmed candle replaces the forming version of itself (matched by
    /// `start_time`) and trims the ring; a forming candle replaces the
    /// previous forming snapshot in place.
    pub fn update(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if let Some(last) = ring.back() {
            if !last.confirmed && last.start_time == candle.start_time {
                ring.pop_back();
            }
        }
        ring.push_back(candle);

        while ring.len() > self.max_candles {
            ring.pop_front();
        }
    }

    /// Return the most recent `count` **confirmed** candles, oldest first.
    pub fn get_confirmed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let confirmed: Vec<&Candle> = ring.iter().filter(|c| c.confirmed).collect();
                let start = confirmed.len().saturating_sub(count);
                confirmed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent confirmed candle, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.confirmed).map(|c| c.close))
    }

    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(start_time: i64, close: f64, confirmed: bool) -> Candle {
        Candle {
            start_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            turnover: 0.0,
            confirmed,
        }
    }

    fn key(sym: &str, iv: &str) -> CandleKey {
        CandleKey {
            symbol: sym.into(),
            interval: iv.into(),
        }
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(3);
        let k = key("BTCUSDT", "1");

        for i in 0..5 {
            buf.update(k.clone(), sample(i * 60_000, 100.0 + i as f64, true));
        }

        assert_eq!(buf.count(&k), 3);
        let closes: Vec<f64> = buf.get_confirmed(&k, 10).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn forming_candle_replaced_in_place() {
        let buf = CandleBuffer::new(10);
        let k = key("ETHUSDT", "5");

        buf.update(k.clone(), sample(0, 50.0, false));
        buf.update(k.clone(), sample(0, 51.0, false));
        assert_eq!(buf.count(&k), 1);

        buf.update(k.clone(), sample(0, 52.0, true));
        assert_eq!(buf.count(&k), 1);
        assert_eq!(buf.last_close(&k), Some(52.0));
    }

    #[test]
    fn get_confirmed_filters_forming() {
        let buf = CandleBuffer::new(10);
        let k = key("BTCUSDT", "1");

        buf.update(k.clone(), sample(0, 100.0, true));
        buf.update(k.clone(), sample(60_000, 101.0, true));
        buf.update(k.clone(), sample(120_000, 102.0, false));

        assert_eq!(buf.get_confirmed(&k, 10).len(), 2);
    }

    #[test]
    fn frame_validation_catches_violations() {
        let good = vec![sample(0, 100.0, true), sample(60_000, 101.0, true)];
        assert!(validate_frame(&good).is_ok());

        let mut dup = good.clone();
        dup[1].start_time = 0;
        assert!(validate_frame(&dup).is_err());

        let mut bad_low = good.clone();
        bad_low[0].low = 200.0;
        assert!(validate_frame(&bad_low).is_err());

        let mut bad_vol = good;
        bad_vol[0].volume = -1.0;
        assert!(validate_frame(&bad_vol).is_err());
    }
}
