// =============================================================================
// Bollinger Bands — 20-period SMA with 2σ bands
// =============================================================================
//
//   mid   = SMA(close, period)
//   upper = mid + k * std(close, period)
//   lower = mid - k * std(close, period)
//   width = (upper - lower) / mid
//   %B    = (close - lower) / (upper - lower)
//
// Invariant: upper >= mid >= lower for k >= 0.
// =============================================================================

use super::ema::{sma_series, std_series};
use super::nan_vec;

/// Bollinger band series aligned with the input closes, NaN during warmup.
#[derive(Debug, Clone)]
pub struct BollingerSeries {
    pub upper: Vec<f64>,
    pub mid: Vec<f64>,
    pub lower: Vec<f64>,
    /// Band width normalised by the middle band.
    pub width: Vec<f64>,
    /// Position of the close within the bands (0 = lower, 1 = upper).
    pub percent: Vec<f64>,
}

/// Compute Bollinger bands for `closes` with the given `period` and deviation
/// multiplier `k`.
pub fn bollinger_series(closes: &[f64], period: usize, k: f64) -> BollingerSeries {
    let n = closes.len();
    let mut out = BollingerSeries {
        upper: nan_vec(n),
        mid: nan_vec(n),
        lower: nan_vec(n),
        width: nan_vec(n),
        percent: nan_vec(n),
    };

    if period < 2 || n < period {
        return out;
    }

    let mid = sma_series(closes, period);
    let sd = std_series(closes, period);

    for i in 0..n {
        if mid[i].is_nan() || sd[i].is_nan() {
            continue;
        }
        let upper = mid[i] + k * sd[i];
        let lower = mid[i] - k * sd[i];
        out.upper[i] = upper;
        out.mid[i] = mid[i];
        out.lower[i] = lower;

        if mid[i] != 0.0 {
            out.width[i] = (upper - lower) / mid[i];
        }
        let band = upper - lower;
        if band > 0.0 {
            out.percent[i] = (closes[i] - lower) / band;
        }
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_warmup_is_nan() {
        let closes: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let out = bollinger_series(&closes, 20, 2.0);
        assert!(out.mid[18].is_nan());
        assert!(!out.mid[19].is_nan());
    }

    #[test]
    fn band_ordering_invariant() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.4).sin() * 3.0)
            .collect();
        let out = bollinger_series(&closes, 20, 2.0);
        for i in 0..closes.len() {
            if !out.mid[i].is_nan() {
                assert!(out.upper[i] >= out.mid[i], "index {i}");
                assert!(out.mid[i] >= out.lower[i], "index {i}");
            }
        }
    }

    #[test]
    fn flat_series_has_zero_width() {
        let closes = vec![100.0; 30];
        let out = bollinger_series(&closes, 20, 2.0);
        assert!(out.width[29].abs() < 1e-12);
        assert!((out.upper[29] - 100.0).abs() < 1e-9);
        assert!((out.lower[29] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn percent_b_midpoint() {
        // A symmetric oscillation: a close equal to the SMA sits at %B = 0.5.
        let mut closes: Vec<f64> = Vec::new();
        for i in 0..40 {
            closes.push(if i % 2 == 0 { 99.0 } else { 101.0 });
        }
        closes.push(100.0);
        let out = bollinger_series(&closes, 20, 2.0);
        let last = *out.percent.last().unwrap();
        assert!((last - 0.5).abs() < 0.05, "expected ~0.5, got {last}");
    }

    #[test]
    fn known_band_values() {
        // Window [1..20]: mean 10.5, sample std sqrt(35).
        let closes: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let out = bollinger_series(&closes, 20, 2.0);
        let sd = 35.0f64.sqrt();
        assert!((out.mid[19] - 10.5).abs() < 1e-9);
        assert!((out.upper[19] - (10.5 + 2.0 * sd)).abs() < 1e-9);
        assert!((out.lower[19] - (10.5 - 2.0 * sd)).abs() < 1e-9);
    }
}
