// =============================================================================
// Market structure analysis — swing levels for stop placement
// =============================================================================
//
// Finds structural swing highs/lows so stops sit behind real support or
// resistance instead of at a mechanical ATR distance. The buffer below the
// level guards against stop-hunting; ATR bounds keep the final distance
// inside [min_atr_distance, max_atr_distance] ATRs.
// =============================================================================

use tracing::debug;

use crate::market_data::Candle;
use crate::types::PositionSide;

/// Default candle lookback for swing detection.
const DEFAULT_LOOKBACK: usize = 20;

/// Analyzer for swing-based stop-loss placement.
pub struct MarketStructureAnalyzer {
    lookback: usize,
    pub min_atr_distance: f64,
    pub max_atr_distance: f64,
    /// Anti-stop-hunt buffer in percent of entry price.
    pub buffer_percent: f64,
}

/// A computed stop plus the token explaining how it was chosen.
#[derive(Debug, Clone)]
pub struct StopPlacement {
    pub price: f64,
    pub reason: String,
}

impl Default for MarketStructureAnalyzer {
    fn default() -> Self {
        Self {
            lookback: DEFAULT_LOOKBACK,
            min_atr_distance: 1.0,
            max_atr_distance: 2.5,
            buffer_percent: 0.5,
        }
    }
}

impl MarketStructureAnalyzer {
    pub fn new(lookback: usize) -> Self {
        Self {
            lookback,
            ..Self::default()
        }
    }

    /// Latest significant swing low (a bar whose low undercuts both
    /// neighbours), scanning backwards. Falls back to the absolute minimum of
    /// the lookback window.
    pub fn find_swing_low(&self, candles: &[Candle]) -> Option<f64> {
        if candles.len() < 3 {
            return None;
        }
        let start = candles.len().saturating_sub(self.lookback);
        let recent = &candles[start..];

        for i in (1..recent.len() - 1).rev() {
            let curr = recent[i].low;
            if curr < recent[i - 1].low && curr < recent[i + 1].low {
                debug!(index = i, level = curr, "swing low found");
                return Some(curr);
            }
        }

        recent
            .iter()
            .map(|c| c.low)
            .fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.min(v)))
            })
    }

    /// Latest significant swing high; mirror of [`find_swing_low`].
    pub fn find_swing_high(&self, candles: &[Candle]) -> Option<f64> {
        if candles.len() < 3 {
            return None;
        }
        let start = candles.len().saturating_sub(self.lookback);
        let recent = &candles[start..];

        for i in (1..recent.len() - 1).rev() {
            let curr = recent[i].high;
            if curr > recent[i - 1].high && curr > recent[i + 1].high {
                debug!(index = i, level = curr, "swing high found");
                return Some(curr);
            }
        }

        recent
            .iter()
            .map(|c| c.high)
            .fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            })
    }

    /// Structure-based stop with anti-stop-hunt buffer and ATR bounds.
    ///
    /// The buffer is the lesser of `buffer_percent` of entry and 0.3 ATR. A
    /// structural distance under `min_atr_distance` ATRs is widened to the
    /// minimum; over `max_atr_distance` ATRs it is capped. With no usable
    /// structure the stop falls back to 1.5 ATR.
    pub fn structure_stop(
        &self,
        entry_price: f64,
        side: PositionSide,
        candles: &[Candle],
        atr: f64,
    ) -> StopPlacement {
        if atr <= 0.0 || !atr.is_finite() {
            return StopPlacement {
                price: self.atr_stop(entry_price, side, 1.5, 0.0),
                reason: "fallback_atr".to_string(),
            };
        }

        let structure_level = match side {
            PositionSide::Long => self.find_swing_low(candles),
            PositionSide::Short => self.find_swing_high(candles),
        };

        let level = match structure_level {
            Some(level) => level,
            None => {
                return StopPlacement {
                    price: self.atr_stop(entry_price, side, 1.5, atr),
                    reason: "fallback_atr".to_string(),
                }
            }
        };

        let buffer = (entry_price * self.buffer_percent / 100.0).min(atr * 0.3);
        let with_buffer = match side {
            PositionSide::Long => level - buffer,
            PositionSide::Short => level + buffer,
        };

        let distance_atr = (entry_price - with_buffer).abs() / atr;

        if distance_atr < self.min_atr_distance {
            StopPlacement {
                price: self.atr_stop(entry_price, side, self.min_atr_distance, atr),
                reason: format!("structure_too_close_{distance_atr:.2}atr"),
            }
        } else if distance_atr > self.max_atr_distance {
            StopPlacement {
                price: self.atr_stop(entry_price, side, self.max_atr_distance, atr),
                reason: format!("structure_too_far_{distance_atr:.2}atr"),
            }
        } else {
            StopPlacement {
                price: with_buffer,
                reason: format!("structure_based_{distance_atr:.2}atr"),
            }
        }
    }

    fn atr_stop(&self, entry_price: f64, side: PositionSide, multiplier: f64, atr: f64) -> f64 {
        let distance = atr * multiplier;
        match side {
            PositionSide::Long => entry_price - distance,
            PositionSide::Short => entry_price + distance,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64) -> Candle {
        let mid = (high + low) / 2.0;
        Candle::new(0, mid, high, low, mid, 10.0)
    }

    #[test]
    fn swing_low_detected() {
        let mut candles: Vec<Candle> = (0..20).map(|_| bar(101.0, 99.0)).collect();
        candles[15] = bar(101.0, 95.0);
        let analyzer = MarketStructureAnalyzer::default();
        assert_eq!(analyzer.find_swing_low(&candles), Some(95.0));
    }

    #[test]
    fn swing_high_detected() {
        let mut candles: Vec<Candle> = (0..20).map(|_| bar(101.0, 99.0)).collect();
        candles[15] = bar(108.0, 99.0);
        let analyzer = MarketStructureAnalyzer::default();
        assert_eq!(analyzer.find_swing_high(&candles), Some(108.0));
    }

    #[test]
    fn no_structure_falls_back_to_extremum() {
        // Monotone decline has no local minimum; absolute min is used.
        let candles: Vec<Candle> = (0..20).map(|i| bar(110.0 - i as f64, 100.0 - i as f64)).collect();
        let analyzer = MarketStructureAnalyzer::default();
        assert_eq!(analyzer.find_swing_low(&candles), Some(81.0));
    }

    #[test]
    fn stop_sits_below_structure_with_buffer() {
        let mut candles: Vec<Candle> = (0..20).map(|_| bar(101.0, 99.0)).collect();
        candles[15] = bar(101.0, 98.5);
        let analyzer = MarketStructureAnalyzer::default();
        let atr = 1.0;
        let entry = 100.0;
        let stop = analyzer.structure_stop(entry, PositionSide::Long, &candles, atr);
        // buffer = min(0.5% * 100, 0.3 * 1.0) = 0.3 => 98.2, distance 1.8 ATR.
        assert!((stop.price - 98.2).abs() < 1e-9, "got {}", stop.price);
        assert!(stop.reason.starts_with("structure_based"));
    }

    #[test]
    fn too_close_structure_widened_to_min_distance() {
        let mut candles: Vec<Candle> = (0..20).map(|_| bar(101.0, 99.8)).collect();
        candles[15] = bar(101.0, 99.7);
        let analyzer = MarketStructureAnalyzer::default();
        let stop = analyzer.structure_stop(100.0, PositionSide::Long, &candles, 1.0);
        assert!((stop.price - 99.0).abs() < 1e-9);
        assert!(stop.reason.starts_with("structure_too_close"));
    }

    #[test]
    fn too_far_structure_capped_at_max_distance() {
        let mut candles: Vec<Candle> = (0..20).map(|_| bar(101.0, 99.0)).collect();
        candles[15] = bar(101.0, 90.0);
        let analyzer = MarketStructureAnalyzer::default();
        let stop = analyzer.structure_stop(100.0, PositionSide::Long, &candles, 1.0);
        assert!((stop.price - 97.5).abs() < 1e-9);
        assert!(stop.reason.starts_with("structure_too_far"));
    }

    #[test]
    fn short_side_mirrors() {
        let mut candles: Vec<Candle> = (0..20).map(|_| bar(101.0, 99.0)).collect();
        candles[15] = bar(101.8, 99.0);
        let analyzer = MarketStructureAnalyzer::default();
        let stop = analyzer.structure_stop(100.0, PositionSide::Short, &candles, 1.0);
        // level 101.8 + buffer 0.3 = 102.1, distance 2.1 ATR (inside bounds).
        assert!((stop.price - 102.1).abs() < 1e-9);
    }

    #[test]
    fn degenerate_atr_falls_back() {
        let candles: Vec<Candle> = (0..20).map(|_| bar(101.0, 99.0)).collect();
        let analyzer = MarketStructureAnalyzer::default();
        let stop = analyzer.structure_stop(100.0, PositionSide::Long, &candles, 0.0);
        assert_eq!(stop.reason, "fallback_atr");
    }
}
