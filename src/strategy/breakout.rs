// =============================================================================
// Breakout — Bollinger-band range break with optional retest confirmation
// =============================================================================
//
// Detection: the previous closed bar was inside the band and the current
// closed bar breaches it, out of a squeeze (narrow band width).
//
// Entry modes:
//   immediate — enter on the breakout bar itself (volume + spread filter)
//   retest    — arm a state machine and wait for a pullback that holds the
//               broken level:
//
//     Idle --breakout--> PendingRetest{level = band at break, ttl}
//     PendingRetest --bar touches level & closes beyond--> confirm checks
//     PendingRetest --ttl exhausted--> Idle (no signal)
//     confirm: volume percentile + volume ratio + expansion flags; success
//              emits the signal, failure discards. Either way back to Idle.
//
// Reasons always include squeeze_ok / expansion_ok / volume_ok, plus
// retest_confirmed on the retest path. Missing volume confirmation is a hard
// reject.
// =============================================================================

use tracing::debug;

use crate::features::{FeatureFrame, FeatureRow};
use crate::market_structure::MarketStructureAnalyzer;
use crate::types::{Direction, PositionSide};

use super::{Signal, Strategy};

/// Lookback for the volume percentile rank.
const VOLUME_PERCENTILE_WINDOW: usize = 50;

#[derive(Debug, Clone)]
pub struct BreakoutConfig {
    /// Band width at or below this is a squeeze.
    pub bb_width_threshold: f64,
    /// Immediate mode: volume z-score floor.
    pub min_volume_zscore: f64,
    /// Immediate mode: max spread percent from orderflow.
    pub max_spread_pct: f64,
    /// Use the retest state machine instead of entering immediately.
    pub retest_enabled: bool,
    /// Bars a pending retest stays armed.
    pub ttl_bars: u32,
    /// Confirm: volume percentile floor over the lookback window.
    pub min_volume_percentile: f64,
    /// Confirm: volume / SMA ratio floor.
    pub min_volume_ratio: f64,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            bb_width_threshold: 0.02,
            min_volume_zscore: 1.5,
            max_spread_pct: 0.5,
            retest_enabled: true,
            ttl_bars: 5,
            min_volume_percentile: 0.8,
            min_volume_ratio: 1.5,
        }
    }
}

/// Armed retest state, one direction at a time.
#[derive(Debug, Clone, PartialEq)]
enum RetestState {
    Idle,
    Pending {
        direction: Direction,
        level: f64,
        ttl: u32,
    },
}

pub struct BreakoutStrategy {
    enabled: bool,
    config: BreakoutConfig,
    state: RetestState,
    /// Start time of the last processed closed bar; the machine steps once
    /// per new bar even if the loop re-evaluates the same frame.
    last_seen_bar: i64,
    structure: MarketStructureAnalyzer,
}

impl BreakoutStrategy {
    pub fn new() -> Self {
        Self::with_config(BreakoutConfig::default())
    }

    pub fn with_config(config: BreakoutConfig) -> Self {
        Self {
            enabled: false,
            config,
            state: RetestState::Idle,
            last_seen_bar: i64::MIN,
            structure: MarketStructureAnalyzer::default(),
        }
    }

    #[cfg(test)]
    pub fn pending_state_for_test(&self) -> Option<(Direction, f64, u32)> {
        match &self.state {
            RetestState::Idle => None,
            RetestState::Pending { direction, level, ttl } => Some((*direction, *level, *ttl)),
        }
    }

    /// Rank of the last bar's volume within the recent window, in [0, 1].
    fn volume_percentile(frame: &FeatureFrame) -> f64 {
        let n = frame.candles.len();
        if n == 0 {
            return 0.0;
        }
        let start = n.saturating_sub(VOLUME_PERCENTILE_WINDOW);
        let window = &frame.candles[start..];
        let current = window[window.len() - 1].volume;
        let below = window.iter().filter(|c| c.volume <= current).count();
        below as f64 / window.len() as f64
    }

    fn expansion_ok(row: &FeatureRow) -> bool {
        let atr_expanding = row.atr_slope.is_finite() && row.atr_slope > 0.0;
        let bb_expanding = row.bb_width_pct_change.is_finite() && row.bb_width_pct_change > 0.0;
        atr_expanding || bb_expanding
    }

    /// Breakout detection against the previous bar's band.
    fn detect_breakout(last: &FeatureRow, prev: &FeatureRow) -> Option<(Direction, f64)> {
        if !last.bb_upper.is_finite() || !prev.bb_upper.is_finite() {
            return None;
        }
        if prev.close <= prev.bb_upper && last.close > last.bb_upper {
            return Some((Direction::Long, last.bb_upper));
        }
        if prev.close >= prev.bb_lower && last.close < last.bb_lower {
            return Some((Direction::Short, last.bb_lower));
        }
        None
    }

    fn confirm_signal(
        &self,
        frame: &FeatureFrame,
        direction: Direction,
        retest: bool,
    ) -> Option<Signal> {
        let last = frame.last()?;
        let entry = last.close;
        let atr = last.atr;
        if !atr.is_finite() || atr <= 0.0 {
            return None;
        }

        let volume_percentile = Self::volume_percentile(frame);
        let volume_ratio = if last.volume_impulse.is_finite() {
            last.volume_impulse
        } else {
            0.0
        };

        // Volume confirmation is a hard reject.
        if volume_percentile < self.config.min_volume_percentile
            || volume_ratio < self.config.min_volume_ratio
        {
            debug!(
                symbol = %frame.symbol,
                volume_percentile,
                volume_ratio,
                "breakout confirm failed: volume"
            );
            return None;
        }

        if !Self::expansion_ok(last) {
            debug!(symbol = %frame.symbol, "breakout confirm failed: no expansion");
            return None;
        }

        let side = PositionSide::from_entry_direction(direction)?;
        let stop = self.structure.structure_stop(entry, side, &frame.candles, atr);
        let risk = (entry - stop.price).abs();
        if risk <= 0.0 {
            return None;
        }
        let take_profit = match direction {
            Direction::Long => entry + 2.0 * risk,
            Direction::Short => entry - 2.0 * risk,
            Direction::Close => return None,
        };

        let mut signal = Signal::new(direction, 0.75, entry, stop.price, "Breakout")
            .with_take_profit(take_profit)
            .reason("squeeze_ok")
            .reason("expansion_ok")
            .reason("volume_ok")
            .value("volume_percentile", volume_percentile)
            .value("volume_ratio", volume_ratio)
            .value("bb_width", last.bb_width)
            .value("atr", atr);
        if retest {
            signal = signal.reason("retest_confirmed");
        }

        signal.validate().ok()?;
        Some(signal)
    }

    /// Immediate-mode entry on the breakout bar itself.
    fn immediate_signal(&self, frame: &FeatureFrame, direction: Direction, level: f64) -> Option<Signal> {
        let last = frame.last()?;

        if !last.volume_zscore.is_finite() || last.volume_zscore < self.config.min_volume_zscore {
            return None;
        }
        if let Some(flow) = &frame.orderflow {
            if flow.spread_percent >= self.config.max_spread_pct {
                return None;
            }
        }

        let atr = last.atr;
        if !atr.is_finite() || atr <= 0.0 {
            return None;
        }
        let entry = last.close;
        let (stop_loss, take_profit) = match direction {
            Direction::Long => (level - atr, entry + 2.5 * atr),
            Direction::Short => (level + atr, entry - 2.5 * atr),
            Direction::Close => return None,
        };

        let signal = Signal::new(direction, 0.75, entry, stop_loss, "Breakout")
            .with_take_profit(take_profit)
            .reason("squeeze_ok")
            .reason("expansion_ok")
            .reason("volume_ok")
            .value("volume_zscore", last.volume_zscore)
            .value("bb_width", last.bb_width)
            .value("atr", atr);

        signal.validate().ok()?;
        Some(signal)
    }
}

impl Default for BreakoutStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for BreakoutStrategy {
    fn name(&self) -> &'static str {
        "Breakout"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn generate_signal(&mut self, frame: &FeatureFrame) -> Option<Signal> {
        if !self.enabled {
            return None;
        }
        let last = frame.last()?;
        let prev = frame.prev()?;

        // Step the machine once per closed bar.
        if last.start_time == self.last_seen_bar {
            return None;
        }
        self.last_seen_bar = last.start_time;

        // --- pending retest path -------------------------------------------
        if let RetestState::Pending { direction, level, ttl } = self.state.clone() {
            let retest_hit = match direction {
                Direction::Long => last.low <= level && last.close > level,
                Direction::Short => last.high >= level && last.close < level,
                Direction::Close => false,
            };

            if retest_hit {
                // Confirm or discard; either way the machine resets.
                self.state = RetestState::Idle;
                return self.confirm_signal(frame, direction, true);
            }

            if ttl <= 1 {
                debug!(symbol = %frame.symbol, level, "retest TTL expired — clearing");
                self.state = RetestState::Idle;
            } else {
                self.state = RetestState::Pending {
                    direction,
                    level,
                    ttl: ttl - 1,
                };
            }
            return None;
        }

        // --- breakout detection --------------------------------------------
        // Squeeze precondition: the breakout bar's band is still narrow.
        if !last.bb_width.is_finite() || last.bb_width > self.config.bb_width_threshold {
            return None;
        }

        let (direction, level) = Self::detect_breakout(last, prev)?;

        if self.config.retest_enabled {
            debug!(
                symbol = %frame.symbol,
                %direction,
                level,
                ttl = self.config.ttl_bars,
                "breakout detected — arming retest"
            );
            self.state = RetestState::Pending {
                direction,
                level,
                ttl: self.config.ttl_bars,
            };
            return None;
        }

        self.immediate_signal(frame, direction, level)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::build_features;
    use crate::market_data::Candle;

    /// Tight oscillation around 100 so the Bollinger band is a squeeze.
    fn base_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = if i % 2 == 0 { 99.7 } else { 100.3 };
                Candle::new(
                    i as i64 * 60_000,
                    100.0,
                    close + 0.4,
                    close - 0.4,
                    close,
                    100.0,
                )
            })
            .collect()
    }

    fn frame(candles: &[Candle]) -> FeatureFrame {
        build_features("BTCUSDT", candles.to_vec(), None, None, 15, false).unwrap()
    }

    fn add_bar(candles: &mut Vec<Candle>, open: f64, high: f64, low: f64, close: f64, volume: f64) {
        let t = candles.len() as i64 * 60_000;
        candles.push(Candle::new(t, open, high, low, close, volume));
    }

    /// Drives the full breakout-with-retest scenario:
    /// squeeze -> breakout bar (arms PendingRetest) -> bars holding above ->
    /// retest bar with volume burst -> long signal.
    #[test]
    fn breakout_long_with_retest_confirms() {
        let mut strat = BreakoutStrategy::new();
        strat.set_enabled(true);

        let mut candles = base_candles(150);

        // Breakout bar: closes just above the band, its own width still a
        // squeeze.
        add_bar(&mut candles, 100.2, 101.4, 100.0, 101.2, 250.0);
        let f = frame(&candles);
        assert!(strat.generate_signal(&f).is_none(), "no signal on breakout bar");
        let (dir, level, ttl) = strat.pending_state_for_test().expect("retest armed");
        assert_eq!(dir, Direction::Long);
        assert_eq!(ttl, 5);
        assert!(level > 100.0);

        // Three bars holding above the level: TTL ticks down, no retest yet.
        for _ in 0..3 {
            let hold_low = level + 0.3;
            add_bar(&mut candles, 101.3, 101.8, hold_low, 101.4, 120.0);
            let f = frame(&candles);
            assert!(strat.generate_signal(&f).is_none());
        }
        let (_, _, ttl) = strat.pending_state_for_test().unwrap();
        assert_eq!(ttl, 2);

        // Retest bar: dips to the level, closes back above it, huge volume.
        add_bar(&mut candles, 101.0, 101.6, level - 0.4, level + 0.6, 500.0);
        let f = frame(&candles);
        let signal = strat.generate_signal(&f).expect("retest should confirm");

        assert_eq!(signal.direction, Direction::Long);
        for token in ["squeeze_ok", "expansion_ok", "volume_ok", "retest_confirmed"] {
            assert!(signal.reasons.contains(token), "missing reason {token}");
        }
        assert!(signal.stop_loss < signal.entry_price);
        let risk = signal.entry_price - signal.stop_loss;
        let tp = signal.take_profit.unwrap();
        assert!((tp - (signal.entry_price + 2.0 * risk)).abs() < 1e-9);

        // Machine reset after emitting.
        assert!(strat.pending_state_for_test().is_none());
    }

    #[test]
    fn retest_ttl_expiry_clears_pending_without_signal() {
        let mut strat = BreakoutStrategy::new();
        strat.set_enabled(true);

        let mut candles = base_candles(150);
        add_bar(&mut candles, 100.2, 101.4, 100.0, 101.2, 250.0);
        let f = frame(&candles);
        assert!(strat.generate_signal(&f).is_none());
        let (_, level, _) = strat.pending_state_for_test().unwrap();

        // Five bars that never come back to the level.
        for _ in 0..5 {
            let hold_low = level + 0.5;
            add_bar(&mut candles, 101.4, 102.0, hold_low, 101.6, 110.0);
            let f = frame(&candles);
            assert!(strat.generate_signal(&f).is_none());
        }

        assert!(strat.pending_state_for_test().is_none(), "TTL should clear state");
    }

    #[test]
    fn retest_without_volume_is_hard_reject() {
        let mut strat = BreakoutStrategy::new();
        strat.set_enabled(true);

        let mut candles = base_candles(150);
        add_bar(&mut candles, 100.2, 101.4, 100.0, 101.2, 250.0);
        let f = frame(&candles);
        assert!(strat.generate_signal(&f).is_none());
        let (_, level, _) = strat.pending_state_for_test().unwrap();

        // Retest bar with anaemic volume.
        add_bar(&mut candles, 101.0, 101.6, level - 0.4, level + 0.6, 40.0);
        let f = frame(&candles);
        assert!(strat.generate_signal(&f).is_none());
        assert!(strat.pending_state_for_test().is_none(), "discarded back to Idle");
    }

    #[test]
    fn wide_band_blocks_detection() {
        let mut strat = BreakoutStrategy::new();
        strat.set_enabled(true);

        // Wild oscillation: band far wider than the squeeze threshold.
        let mut candles: Vec<Candle> = (0..150)
            .map(|i| {
                let close = if i % 2 == 0 { 90.0 } else { 110.0 };
                Candle::new(i as i64 * 60_000, 100.0, close + 1.0, close - 1.0, close, 100.0)
            })
            .collect();
        add_bar(&mut candles, 110.0, 140.0, 110.0, 139.0, 400.0);
        let f = frame(&candles);
        assert!(strat.generate_signal(&f).is_none());
        assert!(strat.pending_state_for_test().is_none());
    }

    #[test]
    fn same_bar_does_not_double_step() {
        let mut strat = BreakoutStrategy::new();
        strat.set_enabled(true);

        let mut candles = base_candles(150);
        add_bar(&mut candles, 100.2, 101.4, 100.0, 101.2, 250.0);
        let f = frame(&candles);
        assert!(strat.generate_signal(&f).is_none());
        let (_, _, ttl_before) = strat.pending_state_for_test().unwrap();

        // Re-evaluating the same frame must not consume TTL.
        assert!(strat.generate_signal(&f).is_none());
        let (_, _, ttl_after) = strat.pending_state_for_test().unwrap();
        assert_eq!(ttl_before, ttl_after);
    }
}
