// =============================================================================
// TrendPullback — enter on a pullback to EMA-20 inside an established trend
// =============================================================================
//
// Long setup:
//   - ADX >= 25 and EMA20 > EMA50 (trend filter)
//   - the closed bar touched or pierced EMA20 (low <= ema_20)
//   - the bar reclaimed it, closing above EMA20 in trend direction
//   - volume z-score above the participation floor
// Short setup mirrors. Stop sits beyond the most recent opposite swing with
// ATR bounds; take-profit targets 2R.
// =============================================================================

use crate::features::FeatureFrame;
use crate::market_structure::MarketStructureAnalyzer;
use crate::types::{Direction, PositionSide};

use super::{Signal, Strategy};

const MIN_ADX: f64 = 25.0;
const MIN_VOLUME_ZSCORE: f64 = 0.5;
const TAKE_PROFIT_R: f64 = 2.0;

pub struct TrendPullbackStrategy {
    enabled: bool,
    structure: MarketStructureAnalyzer,
}

impl TrendPullbackStrategy {
    pub fn new() -> Self {
        Self {
            enabled: false,
            structure: MarketStructureAnalyzer::default(),
        }
    }

    fn build_signal(
        &self,
        frame: &FeatureFrame,
        direction: Direction,
        adx: f64,
        volume_zscore: f64,
    ) -> Option<Signal> {
        let last = frame.last()?;
        let entry = last.close;
        let atr = last.atr;
        if !atr.is_finite() || atr <= 0.0 {
            return None;
        }

        let side = PositionSide::from_entry_direction(direction)?;
        let stop = self.structure.structure_stop(entry, side, &frame.candles, atr);

        let risk = (entry - stop.price).abs();
        if risk <= 0.0 {
            return None;
        }
        let take_profit = match direction {
            Direction::Long => entry + TAKE_PROFIT_R * risk,
            Direction::Short => entry - TAKE_PROFIT_R * risk,
            Direction::Close => return None,
        };

        // Confidence grows with trend strength beyond the ADX floor.
        let confidence = (0.65 + ((adx - MIN_ADX) / 50.0).clamp(0.0, 0.25)).min(1.0);

        let signal = Signal::new(direction, confidence, entry, stop.price, "TrendPullback")
            .with_take_profit(take_profit)
            .reason("trend_ok")
            .reason("pullback_ok")
            .reason("volume_ok")
            .reason(&stop.reason)
            .value("adx", adx)
            .value("volume_zscore", volume_zscore)
            .value("atr", atr)
            .value("ema_20", last.ema_20)
            .value("ema_50", last.ema_50);

        signal.validate().ok()?;
        Some(signal)
    }
}

impl Default for TrendPullbackStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for TrendPullbackStrategy {
    fn name(&self) -> &'static str {
        "TrendPullback"
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

        let adx = last.adx;
        let ema_20 = last.ema_20;
        let ema_50 = last.ema_50;
        if !adx.is_finite() || !ema_20.is_finite() || !ema_50.is_finite() {
            return None;
        }
        if adx < MIN_ADX {
            return None;
        }

        let volume_zscore = last.volume_zscore;
        if !volume_zscore.is_finite() || volume_zscore < MIN_VOLUME_ZSCORE {
            return None;
        }

        // Long: uptrend, bar dipped into EMA20 and closed back above it.
        if ema_20 > ema_50 {
            let touched = last.low <= ema_20;
            let reclaimed = last.close > ema_20 && last.close > last.open;
            if touched && reclaimed {
                return self.build_signal(frame, Direction::Long, adx, volume_zscore);
            }
        }

        // Short: downtrend, bar spiked into EMA20 and closed back below it.
        if ema_20 < ema_50 {
            let touched = last.high >= ema_20;
            let rejected = last.close < ema_20 && last.close < last.open;
            if touched && rejected {
                return self.build_signal(frame, Direction::Short, adx, volume_zscore);
            }
        }

        None
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

    /// An uptrend with a pullback bar at the end that dips to the EMA and
    /// closes back above it on strong volume.
    fn pullback_frame() -> FeatureFrame {
        let mut candles: Vec<Candle> = Vec::new();
        for i in 0..120 {
            let base = 100.0 + i as f64 * 0.8;
            candles.push(Candle::new(
                i * 60_000,
                base,
                base + 1.2,
                base - 1.2,
                base + 0.8,
                100.0,
            ));
        }
        // Pullback bar: dip deep, close strong, volume burst.
        let last_base = 100.0 + 120.0 * 0.8;
        candles.push(Candle::new(
            120 * 60_000,
            last_base - 6.0,
            last_base + 1.5,
            last_base - 9.0,
            last_base + 1.0,
            400.0,
        ));
        build_features("BTCUSDT", candles, None, None, 15, false).unwrap()
    }

    #[test]
    fn disabled_strategy_emits_nothing() {
        let frame = pullback_frame();
        let mut strat = TrendPullbackStrategy::new();
        assert!(strat.generate_signal(&frame).is_none());
    }

    #[test]
    fn pullback_in_uptrend_emits_long() {
        let frame = pullback_frame();
        let mut strat = TrendPullbackStrategy::new();
        strat.set_enabled(true);

        let signal = strat.generate_signal(&frame).expect("expected long signal");
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.stop_loss < signal.entry_price);
        let tp = signal.take_profit.unwrap();
        // TP = entry + 2R exactly.
        let risk = signal.entry_price - signal.stop_loss;
        assert!((tp - (signal.entry_price + 2.0 * risk)).abs() < 1e-9);
        assert!(signal.reasons.contains("trend_ok"));
        assert!(signal.reasons.contains("volume_ok"));
    }

    #[test]
    fn weak_volume_rejects() {
        let mut candles: Vec<Candle> = Vec::new();
        for i in 0..120 {
            let base = 100.0 + i as f64 * 0.8;
            candles.push(Candle::new(
                i * 60_000,
                base,
                base + 1.2,
                base - 1.2,
                base + 0.8,
                100.0,
            ));
        }
        let last_base = 100.0 + 120.0 * 0.8;
        // Same pullback shape but average volume.
        candles.push(Candle::new(
            120 * 60_000,
            last_base - 6.0,
            last_base + 1.5,
            last_base - 9.0,
            last_base + 1.0,
            100.0,
        ));
        let frame = build_features("BTCUSDT", candles, None, None, 15, false).unwrap();

        let mut strat = TrendPullbackStrategy::new();
        strat.set_enabled(true);
        assert!(strat.generate_signal(&frame).is_none());
    }

    #[test]
    fn no_signal_without_pullback() {
        // Plain uptrend, last bar far above EMA20.
        let candles: Vec<Candle> = (0..121)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.8;
                Candle::new(i * 60_000, base, base + 1.2, base - 1.2, base + 0.8, 100.0)
            })
            .collect();
        let frame = build_features("BTCUSDT", candles, None, None, 15, false).unwrap();

        let mut strat = TrendPullbackStrategy::new();
        strat.set_enabled(true);
        assert!(strat.generate_signal(&frame).is_none());
    }
}
