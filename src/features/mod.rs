// =============================================================================
// Feature pipeline — canonical feature frame built from OHLCV + orderbook +
// derivatives inputs
// =============================================================================
//
// The feature row is a fixed struct: every canonical column exists on every
// row, with NaN as the "unavailable" sentinel. Consumers read only canonical
// fields; there is no dynamic column lookup anywhere downstream.
//
// Blocks:
//   1. Trend & structure  (EMA/SMA, ADX/DI, RSI, swing flags)
//   2. Volatility         (ATR, ATR%, Bollinger, realized vol, vol_regime)
//   3. Volume             (volume stats, OBV, VWAP)
//   4. Order flow         (computed once here, never recomputed downstream)
//   5. Derivatives        (written to the last row only)
//   6. Data quality       (anomaly flags)
// =============================================================================

pub mod anomaly;
pub mod orderflow;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::EngineError;
use crate::indicators::adx::adx_series;
use crate::indicators::atr::{atr_percent_series, atr_series};
use crate::indicators::bollinger::bollinger_series;
use crate::indicators::ema::{ema_series, sma_series, std_series};
use crate::indicators::rsi::rsi_series;
use crate::indicators::swing::{swing_series, SWING_WINDOW};
use crate::indicators::volume::{volume_series, VOLUME_WINDOW};
use crate::market_data::{validate_frame, Candle, OrderbookSnapshot};

use anomaly::AnomalyThresholds;
use orderflow::OrderflowFeatures;

/// Bars required before a frame can be built at all.
pub const MIN_BARS: usize = 50;

/// Bars after which every canonical indicator must be available on the last
/// closed bar.
pub const WARMUP_BARS: usize = 200;

/// Rolling window used for the volatility-regime classification.
const VOL_REGIME_WINDOW: usize = 100;

// ---------------------------------------------------------------------------
// Derivatives inputs / features
// ---------------------------------------------------------------------------

/// Raw derivatives snapshot fetched from the venue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DerivativesSnapshot {
    pub mark_price: f64,
    pub index_price: f64,
    pub funding_rate: f64,
    pub open_interest: f64,
    pub oi_change: f64,
}

/// Derived derivatives features, attached to the last row of the frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DerivativesFeatures {
    /// Percent deviation of mark from index.
    pub mark_index_deviation: f64,
    pub funding_rate: f64,
    /// -1 / 0 / +1 with thresholds at ±0.01.
    pub funding_bias: i8,
    pub open_interest: f64,
    pub oi_change: f64,
}

impl DerivativesFeatures {
    pub fn from_snapshot(snapshot: &DerivativesSnapshot) -> Self {
        let mark_index_deviation = if snapshot.index_price > 0.0 {
            (snapshot.mark_price - snapshot.index_price) / snapshot.index_price * 100.0
        } else {
            0.0
        };
        let funding_bias = if snapshot.funding_rate > 0.01 {
            1
        } else if snapshot.funding_rate < -0.01 {
            -1
        } else {
            0
        };
        Self {
            mark_index_deviation,
            funding_rate: snapshot.funding_rate,
            funding_bias,
            open_interest: snapshot.open_interest,
            oi_change: snapshot.oi_change,
        }
    }
}

// ---------------------------------------------------------------------------
// Feature row
// ---------------------------------------------------------------------------

/// One bar extended with the canonical indicator set. NaN = unavailable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRow {
    // Raw bar
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,

    // Trend
    pub adx: f64,
    pub dmp: f64,
    pub dmn: f64,
    pub rsi: f64,
    pub ema_10: f64,
    pub ema_20: f64,
    pub ema_50: f64,
    pub ema_200: f64,
    pub sma_10: f64,
    pub sma_20: f64,
    pub sma_50: f64,
    pub sma_200: f64,
    pub ema_20_slope: f64,

    // Volatility
    pub atr: f64,
    pub atr_percent: f64,
    pub atr_slope: f64,
    pub realized_vol: f64,
    pub bb_upper: f64,
    pub bb_mid: f64,
    pub bb_lower: f64,
    pub bb_width: f64,
    pub bb_percent: f64,
    pub bb_width_pct_change: f64,
    /// -1 low / 0 normal / +1 high.
    pub vol_regime: i8,

    // Volume
    pub volume_sma: f64,
    pub volume_zscore: f64,
    pub volume_impulse: f64,
    pub vwap: f64,
    pub vwap_distance: f64,
    pub obv: f64,

    // Structure
    pub swing_high: f64,
    pub swing_low: f64,
    /// -1 / 0 / +1.
    pub structure: f64,

    // Data quality
    pub anomaly_wick: bool,
    pub anomaly_low_volume: bool,
    pub anomaly_gap: bool,
    pub has_anomaly: bool,
}

// ---------------------------------------------------------------------------
// Feature frame
// ---------------------------------------------------------------------------

/// The full feature frame for one symbol and one fetch cycle.
///
/// `candles`/`rows` hold confirmed bars only, oldest first; the forming bar
/// is dropped before the frame is built.
#[derive(Debug, Clone)]
pub struct FeatureFrame {
    pub symbol: String,
    pub interval_minutes: u32,
    pub candles: Vec<Candle>,
    pub rows: Vec<FeatureRow>,
    pub orderflow: Option<OrderflowFeatures>,
    pub derivatives: Option<DerivativesFeatures>,
}

impl FeatureFrame {
    /// Last closed bar's feature row.
    pub fn last(&self) -> Option<&FeatureRow> {
        self.rows.last()
    }

    /// Row before the last closed bar.
    pub fn prev(&self) -> Option<&FeatureRow> {
        let n = self.rows.len();
        if n >= 2 {
            self.rows.get(n - 2)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Build the canonical feature frame.
///
/// `candles` must be confirmed bars only, oldest first. Orderflow features are
/// computed here exactly once; derivatives features land on the last row.
pub fn build_features(
    symbol: &str,
    candles: Vec<Candle>,
    orderbook: Option<&OrderbookSnapshot>,
    derivatives: Option<&DerivativesSnapshot>,
    interval_minutes: u32,
    is_testnet: bool,
) -> Result<FeatureFrame, EngineError> {
    if candles.len() < MIN_BARS {
        return Err(EngineError::DataQuality(format!(
            "insufficient bars for {symbol}: {} < {MIN_BARS}",
            candles.len()
        )));
    }
    validate_frame(&candles).map_err(|e| EngineError::DataQuality(format!("{symbol}: {e}")))?;

    let n = candles.len();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    // --- Block 1: trend ------------------------------------------------------
    let ema_10 = ema_series(&closes, 10);
    let ema_20 = ema_series(&closes, 20);
    let ema_50 = ema_series(&closes, 50);
    let ema_200 = ema_series(&closes, 200);
    let sma_10 = sma_series(&closes, 10);
    let sma_20 = sma_series(&closes, 20);
    let sma_50 = sma_series(&closes, 50);
    let sma_200 = sma_series(&closes, 200);
    let adx = adx_series(&candles, 14);
    let rsi = rsi_series(&closes, 14);
    let swings = swing_series(&candles, SWING_WINDOW);

    // --- Block 2: volatility -------------------------------------------------
    let atr = atr_series(&candles, 14);
    let atr_percent = atr_percent_series(&candles, 14);
    let bb = bollinger_series(&closes, 20, 2.0);

    let returns: Vec<f64> = std::iter::once(f64::NAN)
        .chain(closes.windows(2).map(|w| {
            if w[0] != 0.0 {
                (w[1] - w[0]) / w[0]
            } else {
                f64::NAN
            }
        }))
        .collect();
    let returns_std = std_series(&returns, 20);
    let realized_vol: Vec<f64> = returns_std
        .iter()
        .map(|s| if s.is_nan() { f64::NAN } else { s * (20.0f64).sqrt() })
        .collect();

    // Volatility regime: ATR% vs its rolling mean ± 0.5σ.
    let atr_pct_mean = sma_series(&atr_percent, VOL_REGIME_WINDOW);
    let atr_pct_std = std_series(&atr_percent, VOL_REGIME_WINDOW);

    // --- Block 3: volume -----------------------------------------------------
    let vol = volume_series(&candles, VOLUME_WINDOW);

    // --- Block 6: data quality ----------------------------------------------
    let thresholds = AnomalyThresholds::for_profile(interval_minutes, is_testnet);
    let anomalies = anomaly::detect_anomalies(&candles, &thresholds);

    // --- Assemble rows -------------------------------------------------------
    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let c = &candles[i];

        let ema_20_slope = if i >= 5 && !ema_20[i].is_nan() && !ema_20[i - 5].is_nan() {
            (ema_20[i] - ema_20[i - 5]) / 5.0
        } else {
            f64::NAN
        };

        let atr_slope = if i >= 5 && !atr_percent[i].is_nan() && !atr_percent[i - 5].is_nan() {
            (atr_percent[i] - atr_percent[i - 5]) / 5.0
        } else {
            f64::NAN
        };

        let bb_width_pct_change = if i >= 1
            && !bb.width[i].is_nan()
            && !bb.width[i - 1].is_nan()
            && bb.width[i - 1] != 0.0
        {
            (bb.width[i] - bb.width[i - 1]) / bb.width[i - 1]
        } else {
            f64::NAN
        };

        let vol_regime = if !atr_pct_mean[i].is_nan() && !atr_pct_std[i].is_nan() {
            if atr_percent[i] < atr_pct_mean[i] - 0.5 * atr_pct_std[i] {
                -1
            } else if atr_percent[i] > atr_pct_mean[i] + 0.5 * atr_pct_std[i] {
                1
            } else {
                0
            }
        } else {
            0
        };

        rows.push(FeatureRow {
            start_time: c.start_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,

            adx: adx.adx[i],
            dmp: adx.plus_di[i],
            dmn: adx.minus_di[i],
            rsi: rsi[i],
            ema_10: ema_10[i],
            ema_20: ema_20[i],
            ema_50: ema_50[i],
            ema_200: ema_200[i],
            sma_10: sma_10[i],
            sma_20: sma_20[i],
            sma_50: sma_50[i],
            sma_200: sma_200[i],
            ema_20_slope,

            atr: atr[i],
            atr_percent: atr_percent[i],
            atr_slope,
            realized_vol: realized_vol[i],
            bb_upper: bb.upper[i],
            bb_mid: bb.mid[i],
            bb_lower: bb.lower[i],
            bb_width: bb.width[i],
            bb_percent: bb.percent[i],
            bb_width_pct_change,
            vol_regime,

            volume_sma: vol.volume_sma[i],
            volume_zscore: vol.volume_zscore[i],
            volume_impulse: vol.volume_impulse[i],
            vwap: vol.vwap[i],
            vwap_distance: vol.vwap_distance[i],
            obv: vol.obv[i],

            swing_high: swings.swing_high[i],
            swing_low: swings.swing_low[i],
            structure: swings.structure[i],

            anomaly_wick: anomalies.wick[i],
            anomaly_low_volume: anomalies.low_volume[i],
            anomaly_gap: anomalies.gap[i],
            has_anomaly: anomalies.wick[i] || anomalies.low_volume[i] || anomalies.gap[i],
        });
    }

    // --- Block 4: order flow (computed once) --------------------------------
    let orderflow = orderbook.and_then(OrderflowFeatures::from_snapshot);

    // --- Block 5: derivatives (last row only) -------------------------------
    let derivatives = derivatives.map(DerivativesFeatures::from_snapshot);

    debug!(
        symbol,
        bars = n,
        has_orderflow = orderflow.is_some(),
        has_derivatives = derivatives.is_some(),
        "feature frame built"
    );

    Ok(FeatureFrame {
        symbol: symbol.to_string(),
        interval_minutes,
        candles,
        rows,
        orderflow,
        derivatives,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trending_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.5;
                Candle::new(
                    i as i64 * 60_000,
                    base,
                    base + 1.0 + (i % 3) as f64 * 0.2,
                    base - 1.0 - (i % 2) as f64 * 0.3,
                    base + 0.5,
                    100.0 + (i % 7) as f64 * 10.0,
                )
            })
            .collect()
    }

    #[test]
    fn insufficient_bars_is_data_quality_error() {
        let candles = trending_candles(10);
        let err = build_features("BTCUSDT", candles, None, None, 1, true).unwrap_err();
        assert_eq!(err.kind(), "data_quality");
    }

    #[test]
    fn warmup_frame_has_all_canonical_columns_on_last_bar() {
        let candles = trending_candles(250);
        let frame = build_features("BTCUSDT", candles, None, None, 1, true).unwrap();
        let last = frame.last().unwrap();

        assert!(!last.adx.is_nan());
        assert!(!last.dmp.is_nan());
        assert!(!last.dmn.is_nan());
        assert!(!last.rsi.is_nan());
        assert!(!last.atr.is_nan());
        assert!(!last.atr_percent.is_nan());
        assert!(!last.ema_10.is_nan());
        assert!(!last.ema_20.is_nan());
        assert!(!last.ema_50.is_nan());
        assert!(!last.ema_200.is_nan());
        assert!(!last.sma_10.is_nan());
        assert!(!last.sma_20.is_nan());
        assert!(!last.sma_50.is_nan());
        assert!(!last.sma_200.is_nan());
        assert!(!last.bb_upper.is_nan());
        assert!(!last.bb_mid.is_nan());
        assert!(!last.bb_lower.is_nan());
        assert!(!last.bb_width.is_nan());
        assert!(!last.bb_percent.is_nan());
        assert!(!last.volume_sma.is_nan());
        assert!(!last.volume_zscore.is_nan());
        assert!(!last.volume_impulse.is_nan());
        assert!(!last.vwap.is_nan());
        assert!(!last.vwap_distance.is_nan());
        assert!(!last.obv.is_nan());
    }

    #[test]
    fn invariants_hold_after_warmup() {
        let candles = trending_candles(250);
        let frame = build_features("BTCUSDT", candles, None, None, 1, true).unwrap();
        for row in frame.rows.iter().skip(WARMUP_BARS) {
            assert!((0.0..=100.0).contains(&row.rsi));
            assert!(row.atr >= 0.0);
            assert!(row.bb_upper >= row.bb_mid);
            assert!(row.bb_mid >= row.bb_lower);
            assert!(matches!(row.vol_regime, -1 | 0 | 1));
        }
    }

    #[test]
    fn invalid_frame_rejected() {
        let mut candles = trending_candles(60);
        candles[30].start_time = candles[29].start_time;
        assert!(build_features("BTCUSDT", candles, None, None, 1, true).is_err());
    }

    #[test]
    fn orderflow_attached_when_book_present() {
        let candles = trending_candles(60);
        let book = OrderbookSnapshot {
            bids: vec![(99.0, 2.0)],
            asks: vec![(100.0, 2.0)],
            update_id: 1,
        };
        let frame = build_features("BTCUSDT", candles, Some(&book), None, 1, true).unwrap();
        let flow = frame.orderflow.unwrap();
        assert!((flow.spread - 1.0).abs() < 1e-12);
    }

    #[test]
    fn derivatives_features_derived() {
        let candles = trending_candles(60);
        let snapshot = DerivativesSnapshot {
            mark_price: 101.0,
            index_price: 100.0,
            funding_rate: 0.02,
            open_interest: 5_000.0,
            oi_change: 120.0,
        };
        let frame = build_features("BTCUSDT", candles, None, Some(&snapshot), 1, true).unwrap();
        let d = frame.derivatives.unwrap();
        assert!((d.mark_index_deviation - 1.0).abs() < 1e-9);
        assert_eq!(d.funding_bias, 1);
    }

    #[test]
    fn funding_bias_thresholds() {
        let mk = |rate: f64| DerivativesFeatures::from_snapshot(&DerivativesSnapshot {
            mark_price: 100.0,
            index_price: 100.0,
            funding_rate: rate,
            open_interest: 0.0,
            oi_change: 0.0,
        });
        assert_eq!(mk(0.005).funding_bias, 0);
        assert_eq!(mk(0.02).funding_bias, 1);
        assert_eq!(mk(-0.02).funding_bias, -1);
    }
}
