// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14. Series output is aligned with the input candles.
// =============================================================================

use super::nan_vec;
use crate::market_data::Candle;

/// Compute the ATR series over `candles` (oldest first), NaN during warmup.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut out = nan_vec(candles.len());
    if period == 0 || candles.len() < period + 1 {
        return out;
    }

    // True Range per bar transition; tr[i] belongs to candle i (i >= 1).
    let mut tr = vec![f64::NAN; candles.len()];
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        tr[i] = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
    }

    // Seed ATR with the SMA of the first `period` TR values.
    let seed: f64 = tr[1..=period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return out;
    }
    out[period] = seed;

    let period_f = period as f64;
    let mut atr = seed;
    for i in (period + 1)..candles.len() {
        atr = (atr * (period_f - 1.0) + tr[i]) / period_f;
        if !atr.is_finite() {
            break;
        }
        out[i] = atr;
    }

    out
}

/// ATR as a percentage of the close, per bar.
///
/// Useful for comparing volatility across assets with different price scales.
pub fn atr_percent_series(candles: &[Candle], period: usize) -> Vec<f64> {
    let atr = atr_series(candles, period);
    candles
        .iter()
        .zip(atr)
        .map(|(c, a)| {
            if a.is_nan() || c.close == 0.0 {
                f64::NAN
            } else {
                (a / c.close) * 100.0
            }
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 100.0)
    }

    #[test]
    fn atr_period_zero_all_nan() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 20];
        assert!(atr_series(&candles, 0).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn atr_insufficient_data_all_nan() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 10];
        assert!(atr_series(&candles, 14).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn atr_constant_range_converges() {
        // All candles have the same range (H-L = 10), close at midpoint.
        let mut candles = Vec::new();
        for i in 0..40 {
            let base = 100.0 + i as f64 * 0.1;
            candles.push(candle(base, base + 5.0, base - 5.0, base));
        }
        let out = atr_series(&candles, 14);
        let last = out[39];
        assert!((last - 10.0).abs() < 1.0, "expected ATR near 10.0, got {last}");
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap scenario: |H - prevClose| > H - L.
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0),
            candle(112.0, 118.0, 110.0, 115.0),
            candle(115.0, 120.0, 113.0, 118.0),
        ];
        let out = atr_series(&candles, 3);
        assert!(out[3] > 7.0, "ATR should reflect the gap, got {}", out[3]);
    }

    #[test]
    fn atr_warmup_boundary() {
        let candles: Vec<Candle> = (0..20)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 2.0, base - 2.0, base + 1.0)
            })
            .collect();
        let out = atr_series(&candles, 14);
        assert!(out[13].is_nan());
        assert!(!out[14].is_nan());
        assert!(out[14] > 0.0);
    }

    #[test]
    fn atr_percent_scales_by_close() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let atr = atr_series(&candles, 14);
        let pct = atr_percent_series(&candles, 14);
        let i = 29;
        assert!((pct[i] - atr[i] / candles[i].close * 100.0).abs() < 1e-12);
    }

    #[test]
    fn atr_is_nonnegative() {
        let candles: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.5).sin() * 10.0;
                candle(base - 0.5, base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        for v in atr_series(&candles, 14) {
            if !v.is_nan() {
                assert!(v >= 0.0);
            }
        }
    }
}
