// =============================================================================
// MeanReversion — fade RSI extremes at the Bollinger bands in quiet ranges
// =============================================================================
//
// Long: RSI below the oversold floor with the close at or below the lower
// band. Short mirrors at the overbought ceiling and upper band. Only active
// with `vol_regime <= 0`; an anti-knife filter rejects setups right after
// extreme wick anomalies. Target is the band midline, stop 1.5 ATR beyond
// entry.
// =============================================================================

use crate::features::FeatureFrame;
use crate::types::Direction;

use super::{Signal, Strategy};

const RSI_OVERSOLD: f64 = 30.0;
const RSI_OVERBOUGHT: f64 = 70.0;
const STOP_ATR_MULTIPLIER: f64 = 1.5;
/// Bars scanned by the anti-knife wick filter.
const ANTI_KNIFE_LOOKBACK: usize = 3;

pub struct MeanReversionStrategy {
    enabled: bool,
    /// Reject entries when a recent bar carried an extreme wick.
    pub anti_knife: bool,
}

impl MeanReversionStrategy {
    pub fn new() -> Self {
        Self {
            enabled: false,
            anti_knife: true,
        }
    }

    fn recent_wick_anomaly(frame: &FeatureFrame) -> bool {
        frame
            .rows
            .iter()
            .rev()
            .take(ANTI_KNIFE_LOOKBACK)
            .any(|row| row.anomaly_wick)
    }

    fn build(&self, frame: &FeatureFrame, direction: Direction) -> Option<Signal> {
        let last = frame.last()?;
        let atr = last.atr;
        if !atr.is_finite() || atr <= 0.0 {
            return None;
        }
        let entry = last.close;

        let (stop_loss, take_profit) = match direction {
            Direction::Long => (entry - STOP_ATR_MULTIPLIER * atr, last.bb_mid),
            Direction::Short => (entry + STOP_ATR_MULTIPLIER * atr, last.bb_mid),
            Direction::Close => return None,
        };
        if !take_profit.is_finite() {
            return None;
        }

        // Confidence scales with how stretched RSI is beyond its band.
        let stretch = match direction {
            Direction::Long => (RSI_OVERSOLD - last.rsi) / RSI_OVERSOLD,
            Direction::Short => (last.rsi - RSI_OVERBOUGHT) / (100.0 - RSI_OVERBOUGHT),
            Direction::Close => 0.0,
        };
        let confidence = (0.6 + 0.3 * stretch.clamp(0.0, 1.0)).min(1.0);

        let signal = Signal::new(direction, confidence, entry, stop_loss, "MeanReversion")
            .with_take_profit(take_profit)
            .reason("rsi_extreme")
            .reason("band_touch")
            .value("rsi", last.rsi)
            .value("bb_percent", last.bb_percent)
            .value("atr", atr)
            .value("vol_regime", last.vol_regime as f64);

        signal.validate().ok()?;
        Some(signal)
    }
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &'static str {
        "MeanReversion"
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

        // Quiet markets only.
        if last.vol_regime > 0 {
            return None;
        }
        if !last.rsi.is_finite() || !last.bb_lower.is_finite() || !last.bb_upper.is_finite() {
            return None;
        }

        if self.anti_knife && Self::recent_wick_anomaly(frame) {
            return None;
        }

        if last.rsi < RSI_OVERSOLD && last.close <= last.bb_lower {
            return self.build(frame, Direction::Long);
        }
        if last.rsi > RSI_OVERBOUGHT && last.close >= last.bb_upper {
            return self.build(frame, Direction::Short);
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

    fn quiet_frame() -> FeatureFrame {
        let candles: Vec<Candle> = (0..150)
            .map(|i| {
                let close = if i % 2 == 0 { 99.8 } else { 100.2 };
                Candle::new(i as i64 * 60_000, 100.0, close + 0.3, close - 0.3, close, 100.0)
            })
            .collect();
        build_features("BTCUSDT", candles, None, None, 15, false).unwrap()
    }

    /// Quiet frame with the last row edited into an oversold band-touch setup.
    fn oversold_frame() -> FeatureFrame {
        let mut frame = quiet_frame();
        let last = frame.rows.last_mut().unwrap();
        last.rsi = 22.0;
        last.close = last.bb_lower;
        last.vol_regime = 0;
        frame
    }

    #[test]
    fn oversold_at_lower_band_emits_long() {
        let frame = oversold_frame();
        let mut strat = MeanReversionStrategy::new();
        strat.set_enabled(true);
        let signal = strat.generate_signal(&frame).expect("expected long signal");
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.take_profit.unwrap() > signal.entry_price);
        assert!(signal.reasons.contains("rsi_extreme"));
        assert!(signal.reasons.contains("band_touch"));
    }

    #[test]
    fn overbought_at_upper_band_emits_short() {
        let mut frame = quiet_frame();
        let last = frame.rows.last_mut().unwrap();
        last.rsi = 78.0;
        last.close = last.bb_upper;
        last.vol_regime = 0;

        let mut strat = MeanReversionStrategy::new();
        strat.set_enabled(true);
        let signal = strat.generate_signal(&frame).expect("expected short signal");
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.stop_loss > signal.entry_price);
        assert!(signal.take_profit.unwrap() < signal.entry_price);
    }

    #[test]
    fn anti_knife_rejects_fresh_wick_anomaly() {
        let mut frame = oversold_frame();
        frame.rows.last_mut().unwrap().anomaly_wick = true;

        let mut strat = MeanReversionStrategy::new();
        strat.set_enabled(true);
        assert!(strat.generate_signal(&frame).is_none());

        // With the filter off the same setup passes.
        strat.anti_knife = false;
        assert!(strat.generate_signal(&frame).is_some());
    }

    #[test]
    fn high_volatility_regime_blocks() {
        let mut frame = oversold_frame();
        frame.rows.last_mut().unwrap().vol_regime = 1;

        let mut strat = MeanReversionStrategy::new();
        strat.set_enabled(true);
        assert!(strat.generate_signal(&frame).is_none());
    }

    #[test]
    fn low_vol_regime_still_trades() {
        let mut frame = oversold_frame();
        frame.rows.last_mut().unwrap().vol_regime = -1;

        let mut strat = MeanReversionStrategy::new();
        strat.set_enabled(true);
        assert!(strat.generate_signal(&frame).is_some());
    }

    #[test]
    fn neutral_rsi_emits_nothing() {
        let frame = quiet_frame();
        let mut strat = MeanReversionStrategy::new();
        strat.set_enabled(true);
        assert!(strat.generate_signal(&frame).is_none());
    }

    #[test]
    fn higher_stretch_raises_confidence() {
        let mut deep = oversold_frame();
        deep.rows.last_mut().unwrap().rsi = 10.0;
        let shallow = oversold_frame(); // rsi 22

        let mut strat = MeanReversionStrategy::new();
        strat.set_enabled(true);
        let deep_sig = strat.generate_signal(&deep).unwrap();
        let shallow_sig = strat.generate_signal(&shallow).unwrap();
        assert!(deep_sig.confidence > shallow_sig.confidence);
    }
}
