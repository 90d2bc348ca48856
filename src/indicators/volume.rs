// =============================================================================
// Volume & participation features — volume SMA / z-score / impulse, OBV, VWAP
// =============================================================================
//
//   volume_zscore  = (v - SMA20(v)) / std20(v)
//   volume_impulse = v / SMA20(v)
//   OBV            = cumulative +/- volume by close direction
//   VWAP           = rolling 20-bar volume-weighted average price
//   vwap_distance  = (close - vwap) / vwap * 100
// =============================================================================

use super::ema::{sma_series, std_series};
use super::nan_vec;
use crate::market_data::Candle;

/// Default rolling window shared by the volume statistics and VWAP.
pub const VOLUME_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct VolumeSeries {
    pub volume_sma: Vec<f64>,
    pub volume_zscore: Vec<f64>,
    pub volume_impulse: Vec<f64>,
    pub obv: Vec<f64>,
    pub vwap: Vec<f64>,
    /// Percent distance of close from VWAP.
    pub vwap_distance: Vec<f64>,
}

/// Compute all volume features over `candles` with the given rolling `window`.
pub fn volume_series(candles: &[Candle], window: usize) -> VolumeSeries {
    let n = candles.len();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let volume_sma = sma_series(&volumes, window);
    let volume_std = std_series(&volumes, window);

    let mut volume_zscore = nan_vec(n);
    let mut volume_impulse = nan_vec(n);
    for i in 0..n {
        if volume_sma[i].is_nan() {
            continue;
        }
        if !volume_std[i].is_nan() && volume_std[i] > 0.0 {
            volume_zscore[i] = (volumes[i] - volume_sma[i]) / volume_std[i];
        } else if !volume_std[i].is_nan() {
            // Constant volume: zero deviation.
            volume_zscore[i] = 0.0;
        }
        if volume_sma[i] > 0.0 {
            volume_impulse[i] = volumes[i] / volume_sma[i];
        }
    }

    // OBV: running sum signed by close direction. Starts at 0 on the first bar.
    let mut obv = nan_vec(n);
    if n > 0 {
        obv[0] = 0.0;
        let mut acc = 0.0;
        for i in 1..n {
            if candles[i].close > candles[i - 1].close {
                acc += candles[i].volume;
            } else if candles[i].close < candles[i - 1].close {
                acc -= candles[i].volume;
            }
            obv[i] = acc;
        }
    }

    // Rolling VWAP over `window` bars using the typical price.
    let mut vwap = nan_vec(n);
    let mut vwap_distance = nan_vec(n);
    if n >= window {
        for i in (window - 1)..n {
            let slice = &candles[i + 1 - window..=i];
            let mut pv = 0.0;
            let mut vol = 0.0;
            for c in slice {
                let typical = (c.high + c.low + c.close) / 3.0;
                pv += typical * c.volume;
                vol += c.volume;
            }
            if vol > 0.0 {
                let w = pv / vol;
                vwap[i] = w;
                if w != 0.0 {
                    vwap_distance[i] = (candles[i].close - w) / w * 100.0;
                }
            }
        }
    }

    VolumeSeries {
        volume_sma,
        volume_zscore,
        volume_impulse,
        obv,
        vwap,
        vwap_distance,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle::new(0, close, close + 1.0, close - 1.0, close, volume)
    }

    #[test]
    fn zscore_of_constant_volume_is_zero() {
        let candles: Vec<Candle> = (0..30).map(|i| candle(100.0 + i as f64, 50.0)).collect();
        let out = volume_series(&candles, 20);
        assert!(out.volume_zscore[29].abs() < 1e-12);
        assert!((out.volume_impulse[29] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zscore_spikes_on_volume_burst() {
        let mut candles: Vec<Candle> = (0..29).map(|i| candle(100.0 + i as f64, 50.0)).collect();
        candles.push(candle(130.0, 500.0));
        let out = volume_series(&candles, 20);
        assert!(out.volume_zscore[29] > 3.0);
        assert!(out.volume_impulse[29] > 5.0);
    }

    #[test]
    fn obv_accumulates_by_direction() {
        let candles = vec![
            candle(100.0, 10.0),
            candle(101.0, 20.0), // up: +20
            candle(100.5, 5.0),  // down: -5
            candle(100.5, 7.0),  // flat: unchanged
        ];
        let out = volume_series(&candles, 2);
        assert_eq!(out.obv[0], 0.0);
        assert_eq!(out.obv[1], 20.0);
        assert_eq!(out.obv[2], 15.0);
        assert_eq!(out.obv[3], 15.0);
    }

    #[test]
    fn vwap_of_flat_market_is_price() {
        let candles: Vec<Candle> = (0..25).map(|_| candle(100.0, 10.0)).collect();
        let out = volume_series(&candles, 20);
        assert!((out.vwap[24] - 100.0).abs() < 1e-9);
        assert!(out.vwap_distance[24].abs() < 1e-9);
    }

    #[test]
    fn vwap_distance_sign_follows_close() {
        let mut candles: Vec<Candle> = (0..24).map(|_| candle(100.0, 10.0)).collect();
        candles.push(candle(110.0, 10.0));
        let out = volume_series(&candles, 20);
        assert!(out.vwap_distance[24] > 0.0);
    }

    #[test]
    fn warmup_is_nan() {
        let candles: Vec<Candle> = (0..25).map(|_| candle(100.0, 10.0)).collect();
        let out = volume_series(&candles, 20);
        assert!(out.volume_sma[18].is_nan());
        assert!(out.vwap[18].is_nan());
        assert!(!out.vwap[19].is_nan());
    }
}
