// =============================================================================
// Confidence scaler — per-strategy linear transform of raw confidence
// =============================================================================
//
//   scaled = clamp(a * raw + b, 0, 1)
//
// A per-symbol override ("SYMBOL:Strategy") takes precedence over the
// per-strategy entry; with neither the identity transform applies.
// =============================================================================

use crate::config::{ConfidenceScalerConfig, ScalerParams};

pub struct ConfidenceScaler {
    config: ConfidenceScalerConfig,
}

impl ConfidenceScaler {
    pub fn new(config: ConfidenceScalerConfig) -> Self {
        Self { config }
    }

    fn params(&self, symbol: &str, strategy: &str) -> ScalerParams {
        let override_key = format!("{symbol}:{strategy}");
        if let Some(p) = self.config.per_symbol.get(&override_key) {
            return *p;
        }
        self.config
            .per_strategy
            .get(strategy)
            .copied()
            .unwrap_or_default()
    }

    /// Apply the transform for (symbol, strategy) to a raw confidence.
    pub fn scale(&self, symbol: &str, strategy: &str, raw: f64) -> f64 {
        let p = self.params(symbol, strategy);
        (p.a * raw + p.b).clamp(0.0, 1.0)
    }
}
