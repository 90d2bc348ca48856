// =============================================================================
// Data-quality anomaly detection
// =============================================================================
//
// Flags per bar:
//   anomaly_wick       — a wick more than `wick_body_ratio` times the body AND
//                        more than `wick_price_pct` of price. A doji guard
//                        keeps open==close bars with modest wicks unflagged.
//   anomaly_low_volume — volume below `low_volume_fraction` of the rolling
//                        50-bar mean.
//   anomaly_gap        — |open - prev close| above `gap_pct` of price.
//
// Thresholds scale with timeframe (shorter bars tolerate more) and venue
// (testnet tolerates more).
// =============================================================================

use crate::indicators::ema::sma_series;
use crate::market_data::Candle;

/// Rolling window for the low-volume baseline.
const VOLUME_BASELINE_WINDOW: usize = 50;

/// Wicks at or below this fraction of price never flag a doji bar.
const DOJI_WICK_GUARD_PCT: f64 = 1.0;

/// Single lookup table for all anomaly thresholds.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyThresholds {
    /// Wick must exceed this multiple of the candle body.
    pub wick_body_ratio: f64,
    /// ...and this percent of price.
    pub wick_price_pct: f64,
    /// Volume below this fraction of the rolling mean flags low volume.
    pub low_volume_fraction: f64,
    /// Open-vs-previous-close gap beyond this percent of price.
    pub gap_pct: f64,
}

impl AnomalyThresholds {
    /// Threshold profile for a (timeframe, venue) pair.
    ///
    /// Base profile is mainnet at >= 15 minute bars. Sub-15m bars double the
    /// price-relative cutoffs; testnet doubles them again.
    pub fn for_profile(interval_minutes: u32, is_testnet: bool) -> Self {
        let mut wick_price_pct = 0.5;
        let mut gap_pct = 1.0;

        if interval_minutes < 15 {
            wick_price_pct *= 2.0;
            gap_pct *= 2.0;
        }
        if is_testnet {
            wick_price_pct *= 2.0;
            gap_pct *= 2.0;
        }

        Self {
            wick_body_ratio: 3.0,
            wick_price_pct,
            low_volume_fraction: 0.2,
            gap_pct,
        }
    }

    /// The strict profile used even when an operator relaxes anomaly blocking
    /// on testnet: only truly extreme bars still count.
    pub fn extreme() -> Self {
        Self {
            wick_body_ratio: 10.0,
            wick_price_pct: 5.0,
            low_volume_fraction: 0.02,
            gap_pct: 5.0,
        }
    }
}

/// Per-bar anomaly flags, aligned with the input candles.
#[derive(Debug, Clone)]
pub struct AnomalyFlags {
    pub wick: Vec<bool>,
    pub low_volume: Vec<bool>,
    pub gap: Vec<bool>,
}

/// Detect anomalies across the whole frame.
pub fn detect_anomalies(candles: &[Candle], thresholds: &AnomalyThresholds) -> AnomalyFlags {
    let n = candles.len();
    let mut flags = AnomalyFlags {
        wick: vec![false; n],
        low_volume: vec![false; n],
        gap: vec![false; n],
    };

    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let volume_mean = sma_series(&volumes, VOLUME_BASELINE_WINDOW);

    for i in 0..n {
        let c = &candles[i];
        if c.close <= 0.0 {
            continue;
        }

        flags.wick[i] = is_wick_anomaly(c, thresholds);

        if !volume_mean[i].is_nan() && volume_mean[i] > 0.0 {
            flags.low_volume[i] = c.volume < thresholds.low_volume_fraction * volume_mean[i];
        }

        if i > 0 {
            let gap = (c.open - candles[i - 1].close).abs();
            flags.gap[i] = gap / c.close * 100.0 > thresholds.gap_pct;
        }
    }

    flags
}

/// Wick rule for one bar, including the doji guard.
pub fn is_wick_anomaly(c: &Candle, thresholds: &AnomalyThresholds) -> bool {
    let body = c.body();
    let max_wick = c.upper_wick().max(c.lower_wick());
    if max_wick <= 0.0 || c.close <= 0.0 {
        return false;
    }

    let wick_pct = max_wick / c.close * 100.0;

    // Doji guard: an open==close bar with modest wicks is normal price action.
    if body <= c.close * 1e-12 && wick_pct <= DOJI_WICK_GUARD_PCT {
        return false;
    }

    max_wick > thresholds.wick_body_ratio * body && wick_pct > thresholds.wick_price_pct
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle::new(0, open, high, low, close, volume)
    }

    #[test]
    fn profile_scales_with_timeframe_and_venue() {
        let strict = AnomalyThresholds::for_profile(15, false);
        let short = AnomalyThresholds::for_profile(1, false);
        let short_testnet = AnomalyThresholds::for_profile(1, true);

        assert!((strict.wick_price_pct - 0.5).abs() < 1e-12);
        assert!((short.wick_price_pct - 1.0).abs() < 1e-12);
        assert!((short_testnet.wick_price_pct - 2.0).abs() < 1e-12);
        assert!((short_testnet.gap_pct - 4.0).abs() < 1e-12);
    }

    #[test]
    fn doji_with_small_wicks_never_flagged() {
        // open == close, wicks at 1% of price.
        let c = bar(100.0, 101.0, 99.0, 100.0, 10.0);
        let t = AnomalyThresholds::for_profile(15, false);
        assert!(!is_wick_anomaly(&c, &t));
    }

    #[test]
    fn huge_wick_on_small_body_flagged() {
        // Body 0.1, lower wick 5.0 (5% of price) — beyond any profile.
        let c = bar(100.0, 100.2, 95.0, 100.1, 10.0);
        let t = AnomalyThresholds::for_profile(15, false);
        assert!(is_wick_anomaly(&c, &t));
    }

    #[test]
    fn proportionate_wick_not_flagged() {
        // Wick comparable to body.
        let c = bar(100.0, 103.0, 99.0, 102.0, 10.0);
        let t = AnomalyThresholds::for_profile(15, false);
        assert!(!is_wick_anomaly(&c, &t));
    }

    #[test]
    fn low_volume_flagged_against_rolling_mean() {
        let mut candles: Vec<Candle> = (0..60).map(|_| bar(100.0, 101.0, 99.0, 100.5, 100.0)).collect();
        candles.push(bar(100.0, 101.0, 99.0, 100.5, 5.0)); // 5% of mean
        let t = AnomalyThresholds::for_profile(15, false);
        let flags = detect_anomalies(&candles, &t);
        assert!(flags.low_volume[60]);
        assert!(!flags.low_volume[59]);
    }

    #[test]
    fn gap_flagged() {
        let candles = vec![
            bar(100.0, 101.0, 99.0, 100.0, 10.0),
            bar(103.0, 104.0, 102.5, 103.5, 10.0), // 3% gap from prev close
        ];
        let t = AnomalyThresholds::for_profile(15, false);
        let flags = detect_anomalies(&candles, &t);
        assert!(flags.gap[1]);
        assert!(!flags.gap[0]);
    }

    #[test]
    fn testnet_tolerates_wider_gaps() {
        let candles = vec![
            bar(100.0, 101.0, 99.0, 100.0, 10.0),
            bar(103.0, 104.0, 102.5, 103.5, 10.0),
        ];
        let t = AnomalyThresholds::for_profile(1, true); // gap cutoff 4%
        let flags = detect_anomalies(&candles, &t);
        assert!(!flags.gap[1]);
    }

    #[test]
    fn extreme_profile_is_stricter_to_trip() {
        let c = bar(100.0, 100.2, 95.0, 100.1, 10.0);
        assert!(!is_wick_anomaly(&c, &AnomalyThresholds::extreme()));
        let extreme = bar(100.0, 100.2, 88.0, 100.1, 10.0); // 12% wick
        assert!(is_wick_anomaly(&extreme, &AnomalyThresholds::extreme()));
    }
}
