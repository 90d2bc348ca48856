// =============================================================================
// Multi-timeframe cache — recent bars with a pre-computed indicator subset
// =============================================================================
//
// Each trading loop pushes its latest confirmed bar (per configured timeframe)
// into this cache. The meta-layer's multi-timeframe confluence check reads the
// 1m / 5m / 15m entries:
//   - 1m and 5m trend (close vs ema_20) must agree with the signal direction;
//   - 15m atr_percent must not exceed the high-volatility ceiling.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Direction;

/// Maximum bars retained per timeframe.
const MAX_BARS: usize = 500;

/// One cached bar with the indicator subset confluence needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedBar {
    pub start_time: i64,
    pub close: f64,
    pub ema_20: f64,
    pub atr_percent: f64,
}

/// Per-symbol cache of recent bars keyed by timeframe ("1", "5", "15", ...).
pub struct TimeframeCache {
    bars: RwLock<HashMap<String, VecDeque<CachedBar>>>,
}

impl TimeframeCache {
    pub fn new() -> Self {
        Self {
            bars: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or update the latest bar for `timeframe`. A bar with the same
    /// `start_time` as the current tail replaces it.
    pub fn push(&self, timeframe: &str, bar: CachedBar) {
        let mut map = self.bars.write();
        let ring = map
            .entry(timeframe.to_string())
            .or_insert_with(|| VecDeque::with_capacity(MAX_BARS + 1));

        if let Some(last) = ring.back() {
            if last.start_time == bar.start_time {
                ring.pop_back();
            }
        }
        ring.push_back(bar);
        while ring.len() > MAX_BARS {
            ring.pop_front();
        }
    }

    /// Latest cached bar for a timeframe.
    pub fn latest(&self, timeframe: &str) -> Option<CachedBar> {
        let map = self.bars.read();
        map.get(timeframe).and_then(|r| r.back().cloned())
    }

    pub fn len(&self, timeframe: &str) -> usize {
        let map = self.bars.read();
        map.get(timeframe).map_or(0, VecDeque::len)
    }

    /// Multi-timeframe confluence check for a directional signal.
    ///
    /// Returns `None` when any required timeframe is missing (the caller
    /// treats missing data as "no confluence opinion" and passes the signal),
    /// otherwise `Some(confirmed)`.
    pub fn check_confluence(&self, direction: Direction, max_atr_pct_15m: f64) -> Option<bool> {
        let bar_1m = self.latest("1")?;
        let bar_5m = self.latest("5")?;
        let bar_15m = self.latest("15")?;

        let wants_up = match direction {
            Direction::Long => true,
            Direction::Short => false,
            Direction::Close => return Some(true),
        };

        let trend_1m_up = bar_1m.close > bar_1m.ema_20;
        let trend_5m_up = bar_5m.close > bar_5m.ema_20;

        if trend_1m_up != wants_up || trend_5m_up != wants_up {
            return Some(false);
        }

        if bar_15m.atr_percent.is_finite() && bar_15m.atr_percent > max_atr_pct_15m {
            return Some(false);
        }

        Some(true)
    }
}

impl Default for TimeframeCache {
    fn default() -> Self {
        Self::new()
    }
}
