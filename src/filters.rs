// =============================================================================
// No-Trade Zones — hygiene gates evaluated on the last closed bar
// =============================================================================
//
// Gates run in a fixed order; the first failure blocks the tick and reports a
// stable snake_case reason plus the numeric value that tripped it:
//
//   1. data_anomaly            (relaxed on testnet when the operator allows;
//                               the extreme thresholds still apply)
//   2. orderbook_invalid       (caller-provided flag)
//   3. excessive_spread
//   4. depth_imbalance         (optional; off by default on testnet)
//   5. error_budget_exceeded
//   6. extreme_volatility      (vol_regime == +1 and ATR% above ceiling)
//
// The check is a pure function of its inputs: calling it twice with the same
// inputs returns the same verdict.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::NoTradeZonesConfig;
use crate::features::anomaly::{is_wick_anomaly, AnomalyThresholds};
use crate::features::FeatureFrame;
use crate::types::Environment;

/// Inputs that come from outside the feature frame.
#[derive(Debug, Clone, Copy)]
pub struct FilterContext {
    /// Derived by the caller from best-bid/ask deviation or snapshot staleness.
    pub orderbook_valid: bool,
    /// Recent operational errors (sliding window).
    pub error_count: u32,
}

/// Outcome of a no-trade-zone evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub details: BTreeMap<String, f64>,
}

impl FilterVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            details: BTreeMap::new(),
        }
    }

    fn block(reason: &str, key: &str, value: f64) -> Self {
        let mut details = BTreeMap::new();
        details.insert(key.to_string(), value);
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            details,
        }
    }
}

/// Hygiene filter bank for one symbol.
pub struct NoTradeZones {
    config: NoTradeZonesConfig,
    environment: Environment,
}

impl NoTradeZones {
    pub fn new(config: NoTradeZonesConfig, environment: Environment) -> Self {
        Self {
            config,
            environment,
        }
    }

    /// Evaluate all gates against the frame's last closed bar.
    pub fn check(&self, frame: &FeatureFrame, ctx: &FilterContext) -> FilterVerdict {
        let last = match frame.last() {
            Some(row) => row,
            None => return FilterVerdict::block("data_anomaly", "bars", 0.0),
        };

        // 1. Data anomaly.
        if last.has_anomaly {
            let relaxed =
                self.environment.is_testnet() && self.config.allow_anomaly_on_testnet;
            if !relaxed {
                return FilterVerdict::block("data_anomaly", "has_anomaly", 1.0);
            }
            // Relaxed path: only a truly extreme bar still blocks.
            if let Some(candle) = frame.candles.last() {
                let extreme = AnomalyThresholds::extreme();
                let extreme_gap = frame
                    .candles
                    .len()
                    .checked_sub(2)
                    .and_then(|i| frame.candles.get(i))
                    .map(|prev| {
                        let gap = (candle.open - prev.close).abs();
                        candle.close > 0.0 && gap / candle.close * 100.0 > extreme.gap_pct
                    })
                    .unwrap_or(false);
                if is_wick_anomaly(candle, &extreme) || extreme_gap {
                    return FilterVerdict::block("data_anomaly", "has_anomaly", 1.0);
                }
            }
        }

        // 2. Orderbook invalid.
        if !ctx.orderbook_valid {
            return FilterVerdict::block("orderbook_invalid", "orderbook_valid", 0.0);
        }

        // 3. Excessive spread.
        if let Some(flow) = &frame.orderflow {
            if flow.spread_percent > self.config.max_spread_pct {
                return FilterVerdict::block(
                    "excessive_spread",
                    "spread_percent",
                    flow.spread_percent,
                );
            }

            // 4. Depth imbalance (optional gate).
            if self.config.depth_imbalance_enabled(self.environment)
                && flow.depth_imbalance.abs() > self.config.max_depth_imbalance
            {
                return FilterVerdict::block(
                    "depth_imbalance",
                    "depth_imbalance",
                    flow.depth_imbalance,
                );
            }
        }

        // 5. Error budget.
        if ctx.error_count > self.config.error_budget_ceiling {
            return FilterVerdict::block(
                "error_budget_exceeded",
                "error_count",
                ctx.error_count as f64,
            );
        }

        // 6. Extreme volatility.
        if last.vol_regime == 1
            && last.atr_percent.is_finite()
            && last.atr_percent > self.config.max_atr_pct
        {
            return FilterVerdict::block("extreme_volatility", "atr_percent", last.atr_percent);
        }

        FilterVerdict::allow()
    }
}
