// =============================================================================
// Market Regime Scorer — continuous scores plus a categorical label
// =============================================================================
//
// Components (each in [0, 1]):
//   trend_score      — ADX strength, EMA separation, BB expansion
//   range_score      — low ADX, narrow/contracting BB, stable ATR
//   volatility_score — ATR% normalised between high and extreme thresholds
//   chop_score       — low ADX, unstable ATR slope, erratic volume, BB churn
//
// Label priority (first match wins):
//   volatility_score >= 0.7            => high_vol
//   chop_score >= 0.6                  => choppy
//   trend_score > range_score          => trend_up / trend_down by EMA stack
//   range_score >= 0.5                 => range
//   otherwise                          => unknown
//
// Missing critical indicators yield `unknown` with zero scores.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::FeatureRow;

// =============================================================================
// Types
// =============================================================================

/// Coarse market state label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeLabel {
    TrendUp,
    TrendDown,
    Range,
    HighVol,
    Choppy,
    Unknown,
}

impl RegimeLabel {
    pub fn is_trend(&self) -> bool {
        matches!(self, Self::TrendUp | Self::TrendDown)
    }
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrendUp => write!(f, "trend_up"),
            Self::TrendDown => write!(f, "trend_down"),
            Self::Range => write!(f, "range"),
            Self::HighVol => write!(f, "high_vol"),
            Self::Choppy => write!(f, "choppy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Complete result of one regime evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeScores {
    pub trend_score: f64,
    pub range_score: f64,
    pub volatility_score: f64,
    pub chop_score: f64,
    pub label: RegimeLabel,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub values: BTreeMap<String, f64>,
}

// =============================================================================
// RegimeScorer
// =============================================================================

/// Multi-factor regime scorer. Design constants live on the struct so tests
/// can exercise the normalisation boundaries.
pub struct RegimeScorer {
    adx_trend_min: f64,
    adx_trend_max: f64,
    adx_range_max: f64,
    bb_width_range_max: f64,
    atr_pct_high: f64,
    atr_pct_extreme: f64,
}

impl Default for RegimeScorer {
    fn default() -> Self {
        Self {
            adx_trend_min: 25.0,
            adx_trend_max: 50.0,
            adx_range_max: 20.0,
            bb_width_range_max: 0.03,
            atr_pct_high: 3.0,
            atr_pct_extreme: 7.0,
        }
    }
}

impl RegimeScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score the last closed bar of a feature frame.
    pub fn score(&self, row: &FeatureRow) -> RegimeScores {
        let adx = finite_or(row.adx, 0.0);
        let atr_percent = finite_or(row.atr_percent, 0.0);
        let bb_width = finite_or(row.bb_width, 0.0);
        let bb_width_pct_change = finite_or(row.bb_width_pct_change, 0.0);
        let atr_slope = finite_or(row.atr_slope, 0.0);
        let volume_zscore = finite_or(row.volume_zscore, 0.0);
        let ema_20 = row.ema_20;
        let ema_50 = row.ema_50;
        let close = row.close;

        // Critical indicators: without the EMA stack no label is trustworthy.
        if !ema_20.is_finite() || !ema_50.is_finite() || ema_20 == 0.0 || ema_50 == 0.0 || close == 0.0 {
            return Self::neutral("missing_critical_indicators");
        }

        // === scoring components ===

        let trend_score = self.trend_score(adx, ema_20, ema_50, bb_width_pct_change);
        let range_score = self.range_score(adx, bb_width, bb_width_pct_change, atr_slope);
        let volatility_score = normalize(atr_percent, self.atr_pct_high, self.atr_pct_extreme);
        let chop_score = chop_score(adx, bb_width_pct_change, atr_slope, volume_zscore);

        // === label ===

        let (label, confidence, reasons) = determine_label(
            trend_score,
            range_score,
            volatility_score,
            chop_score,
            ema_20,
            ema_50,
            close,
        );

        let mut values = BTreeMap::new();
        values.insert("adx".to_string(), adx);
        values.insert("atr_percent".to_string(), atr_percent);
        values.insert("bb_width".to_string(), bb_width);
        values.insert("bb_width_pct_change".to_string(), bb_width_pct_change);
        values.insert("atr_slope".to_string(), atr_slope);
        values.insert("ema_20".to_string(), ema_20);
        values.insert("ema_50".to_string(), ema_50);
        values.insert("close".to_string(), close);
        values.insert("volume_zscore".to_string(), volume_zscore);

        debug!(
            label = %label,
            trend = format!("{trend_score:.3}"),
            range = format!("{range_score:.3}"),
            vol = format!("{volatility_score:.3}"),
            chop = format!("{chop_score:.3}"),
            "regime scored"
        );

        RegimeScores {
            trend_score,
            range_score,
            volatility_score,
            chop_score,
            label,
            confidence,
            reasons,
            values,
        }
    }

    /// Trend strength: ADX 50%, EMA separation 30%, BB expansion 20%.
    fn trend_score(&self, adx: f64, ema_20: f64, ema_50: f64, bb_width_pct_change: f64) -> f64 {
        let adx_component = normalize(adx, self.adx_trend_min, self.adx_trend_max);

        let ema_diff_pct = if ema_50 > 0.0 {
            (ema_20 - ema_50).abs() / ema_50
        } else {
            0.0
        };
        let ema_component = (ema_diff_pct / 0.05).min(1.0);

        let bb_component = (bb_width_pct_change / 0.2).clamp(0.0, 1.0);

        (0.5 * adx_component + 0.3 * ema_component + 0.2 * bb_component).clamp(0.0, 1.0)
    }

    /// Range likelihood: low ADX 40%, narrow BB 30%, contracting BB 20%,
    /// stable ATR 10%.
    fn range_score(&self, adx: f64, bb_width: f64, bb_width_pct_change: f64, atr_slope: f64) -> f64 {
        let adx_component = 1.0 - normalize(adx, 0.0, self.adx_range_max);
        let bb_component = 1.0 - normalize(bb_width, 0.0, self.bb_width_range_max);
        let bb_change_component = (-bb_width_pct_change / 0.2).clamp(0.0, 1.0);
        let atr_component = 1.0 - atr_slope.abs().min(1.0);

        (0.4 * adx_component
            + 0.3 * bb_component
            + 0.2 * bb_change_component
            + 0.1 * atr_component)
            .clamp(0.0, 1.0)
    }

    fn neutral(reason: &str) -> RegimeScores {
        RegimeScores {
            trend_score: 0.0,
            range_score: 0.0,
            volatility_score: 0.0,
            chop_score: 0.0,
            label: RegimeLabel::Unknown,
            confidence: 0.0,
            reasons: vec![reason.to_string()],
            values: BTreeMap::new(),
        }
    }
}

/// Chop: low ADX 40%, unstable ATR 30%, erratic volume 20%, BB churn 10%.
fn chop_score(adx: f64, bb_width_pct_change: f64, atr_slope: f64, volume_zscore: f64) -> f64 {
    let adx_component = 1.0 - normalize(adx, 0.0, 25.0);
    let atr_component = (atr_slope.abs() / 2.0).min(1.0);
    let volume_component = (volume_zscore.abs() / 3.0).min(1.0);
    let bb_component = (bb_width_pct_change.abs() / 0.3).min(1.0);

    (0.4 * adx_component + 0.3 * atr_component + 0.2 * volume_component + 0.1 * bb_component)
        .clamp(0.0, 1.0)
}

fn determine_label(
    trend_score: f64,
    range_score: f64,
    volatility_score: f64,
    chop_score: f64,
    ema_20: f64,
    ema_50: f64,
    close: f64,
) -> (RegimeLabel, f64, Vec<String>) {
    // Priority 1: extreme volatility.
    if volatility_score >= 0.7 {
        return (
            RegimeLabel::HighVol,
            volatility_score,
            vec!["extreme_volatility".to_string()],
        );
    }

    // Priority 2: choppy / saw-tooth market.
    if chop_score >= 0.6 {
        return (
            RegimeLabel::Choppy,
            chop_score,
            vec!["high_noise".to_string(), "no_clear_direction".to_string()],
        );
    }

    // Priority 3: trend vs range.
    if trend_score > range_score {
        let mut reasons = Vec::new();
        let label = if ema_20 > ema_50 && close > ema_50 {
            reasons.push("strong_adx".to_string());
            reasons.push("ema_aligned_up".to_string());
            RegimeLabel::TrendUp
        } else if ema_20 < ema_50 && close < ema_50 {
            reasons.push("strong_adx".to_string());
            reasons.push("ema_aligned_down".to_string());
            RegimeLabel::TrendDown
        } else {
            reasons.push("partial_trend".to_string());
            if ema_20 > ema_50 {
                RegimeLabel::TrendUp
            } else {
                RegimeLabel::TrendDown
            }
        };
        return (label, trend_score, reasons);
    }

    if range_score >= 0.5 {
        return (
            RegimeLabel::Range,
            range_score,
            vec!["low_adx".to_string(), "narrow_bb".to_string()],
        );
    }

    (
        RegimeLabel::Unknown,
        0.5,
        vec!["mixed_signals".to_string()],
    )
}

/// Normalise `value` into [0, 1] between `min_val` and `max_val`.
fn normalize(value: f64, min_val: f64, max_val: f64) -> f64 {
    if max_val <= min_val {
        return if value < max_val { 0.0 } else { 1.0 };
    }
    ((value - min_val) / (max_val - min_val)).clamp(0.0, 1.0)
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}
