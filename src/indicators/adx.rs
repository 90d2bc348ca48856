// =============================================================================
// Average Directional Index (ADX) with +DI / -DI series
// =============================================================================
//
// Calculation pipeline:
//   1. Compute +DM (positive directional movement) and -DM per bar.
//   2. Compute True Range (TR) per bar.
//   3. Apply Wilder's smoothing (period) to +DM, -DM, and TR.
//   4. Derive +DI = smoothed(+DM) / smoothed(TR) * 100
//            -DI = smoothed(-DM) / smoothed(TR) * 100
//   5. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   6. ADX = Wilder's smoothed average of DX over `period` bars.
//
// Interpretation:
//   ADX > 25  => trending market
//   ADX < 20  => ranging / choppy market
// =============================================================================

use super::nan_vec;
use crate::market_data::Candle;

/// ADX output: three series aligned with the input candles, NaN during warmup.
#[derive(Debug, Clone)]
pub struct AdxSeries {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

/// Compute ADX, +DI, and -DI series over `candles` (oldest first).
///
/// The first +DI/-DI appears at index `period`; the first ADX at index
/// `2 * period` (one period of DX values is needed to seed the average).
pub fn adx_series(candles: &[Candle], period: usize) -> AdxSeries {
    let n = candles.len();
    let mut out = AdxSeries {
        adx: nan_vec(n),
        plus_di: nan_vec(n),
        minus_di: nan_vec(n),
    };

    if period == 0 || n < 2 * period + 1 {
        return out;
    }

    let period_f = period as f64;

    // ------------------------------------------------------------------
    // Step 1 & 2: raw +DM, -DM, TR per bar transition (index i >= 1)
    // ------------------------------------------------------------------
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    let mut tr = vec![0.0; n];

    for i in 1..n {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_high = candles[i - 1].high;
        let prev_low = candles[i - 1].low;
        let prev_close = candles[i - 1].close;

        tr[i] = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;

        plus_dm[i] = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        minus_dm[i] = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };
    }

    // ------------------------------------------------------------------
    // Step 3-5: Wilder smoothing and DI / DX series
    // ------------------------------------------------------------------
    let mut smooth_plus: f64 = plus_dm[1..=period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[1..=period].iter().sum();
    let mut smooth_tr: f64 = tr[1..=period].iter().sum();

    let mut dx = nan_vec(n);

    let write_di = |out: &mut AdxSeries,
                    dx: &mut Vec<f64>,
                    i: usize,
                    sp: f64,
                    sm: f64,
                    st: f64| {
        if st == 0.0 {
            return;
        }
        let plus_di = sp / st * 100.0;
        let minus_di = sm / st * 100.0;
        out.plus_di[i] = plus_di;
        out.minus_di[i] = minus_di;

        let di_sum = plus_di + minus_di;
        dx[i] = if di_sum == 0.0 {
            0.0
        } else {
            (plus_di - minus_di).abs() / di_sum * 100.0
        };
    };

    write_di(&mut out, &mut dx, period, smooth_plus, smooth_minus, smooth_tr);

    for i in (period + 1)..n {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr[i];
        write_di(&mut out, &mut dx, i, smooth_plus, smooth_minus, smooth_tr);
    }

    // ------------------------------------------------------------------
    // Step 6: ADX = Wilder-smoothed average of DX
    // ------------------------------------------------------------------
    let seed_slice = &dx[period..period + period];
    if seed_slice.iter().any(|v| v.is_nan()) {
        return out;
    }
    let adx_seed: f64 = seed_slice.iter().sum::<f64>() / period_f;
    if !adx_seed.is_finite() {
        return out;
    }
    out.adx[2 * period] = adx_seed;

    let mut adx = adx_seed;
    for i in (2 * period + 1)..n {
        if dx[i].is_nan() {
            break;
        }
        adx = (adx * (period_f - 1.0) + dx[i]) / period_f;
        if !adx.is_finite() {
            break;
        }
        out.adx[i] = adx;
    }

    out
}
