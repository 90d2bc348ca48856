// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
//   RS  = smoothed average gain / smoothed average loss
//   RSI = 100 - 100 / (1 + RS)
//
// The first average gain/loss is the SMA of the first `period` moves; later
// values use the Wilder recurrence. Output is in [0, 100], aligned with the
// input, NaN during warmup.
// =============================================================================

use super::nan_vec;

/// Compute the RSI series for `closes` with the given `period`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    let mut out = nan_vec(closes.len());
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let period_f = period as f64;

    // Seed averages from the first `period` moves.
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss += -change;
        }
    }
    avg_gain /= period_f;
    avg_loss /= period_f;

    if !avg_gain.is_finite() || !avg_loss.is_finite() {
        return out;
    }
    out[period] = rsi_from_averages(avg_gain, avg_loss);

    for i in (period + 1)..closes.len() {
        let change = closes[i] - closes[i - 1];
        let (gain, loss) = if change > 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        if !avg_gain.is_finite() || !avg_loss.is_finite() {
            break;
        }
        out[i] = rsi_from_averages(avg_gain, avg_loss);
    }

    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            // No movement at all: neutral.
            return 50.0;
        }
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
