// =============================================================================
// Strategy protocol — the common contract all signal generators implement
// =============================================================================
//
// Per-symbol isolation is a safety contract: every symbol loop receives its
// own strategy instances from `StrategyFactory`, and `Strategy` is
// deliberately neither Clone nor Sync so instances cannot be shared across
// loops by accident.
// =============================================================================

pub mod breakout;
pub mod confidence;
pub mod mean_reversion;
pub mod meta_layer;
pub mod router;
pub mod trend_pullback;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::features::FeatureFrame;
use crate::types::Direction;

pub use breakout::BreakoutStrategy;
pub use confidence::ConfidenceScaler;
pub use mean_reversion::MeanReversionStrategy;
pub use meta_layer::MetaLayer;
pub use router::{Arbitrator, RouteOutcome, WeightedRouter};
pub use trend_pullback::TrendPullbackStrategy;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// The common signal record every strategy emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    /// Scaled confidence in [0, 1] (equals raw until the scaler runs).
    pub confidence: f64,
    /// Confidence as emitted by the strategy, before scaling.
    pub raw_confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub strategy: String,
    /// Regime label attached by the meta-layer.
    pub regime: String,
    pub reasons: BTreeSet<String>,
    pub values: BTreeMap<String, f64>,
    pub mtf_confirmed: Option<bool>,
}

impl Signal {
    pub fn new(
        direction: Direction,
        confidence: f64,
        entry_price: f64,
        stop_loss: f64,
        strategy: &str,
    ) -> Self {
        Self {
            direction,
            confidence,
            raw_confidence: confidence,
            entry_price,
            stop_loss,
            take_profit: None,
            strategy: strategy.to_string(),
            regime: String::new(),
            reasons: BTreeSet::new(),
            values: BTreeMap::new(),
            mtf_confirmed: None,
        }
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    pub fn reason(mut self, token: &str) -> Self {
        self.reasons.insert(token.to_string());
        self
    }

    pub fn value(mut self, key: &str, value: f64) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    /// Validate the stop/target geometry:
    /// long  => stop < entry < take_profit
    /// short => take_profit < entry < stop
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} out of [0,1]", self.confidence));
        }
        match self.direction {
            Direction::Long => {
                if self.stop_loss >= self.entry_price {
                    return Err("long stop_loss must be below entry".to_string());
                }
                if let Some(tp) = self.take_profit {
                    if tp <= self.entry_price {
                        return Err("long take_profit must be above entry".to_string());
                    }
                }
            }
            Direction::Short => {
                if self.stop_loss <= self.entry_price {
                    return Err("short stop_loss must be above entry".to_string());
                }
                if let Some(tp) = self.take_profit {
                    if tp >= self.entry_price {
                        return Err("short take_profit must be below entry".to_string());
                    }
                }
            }
            Direction::Close => {}
        }
        Ok(())
    }

    /// Risk per unit implied by entry and stop.
    pub fn risk_per_unit(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// Common protocol for all strategies. `generate_signal` may mutate internal
/// state (e.g. the breakout retest machine) but is pure given that state.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    fn generate_signal(&mut self, frame: &FeatureFrame) -> Option<Signal>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Creates fresh strategy instances. Called once per symbol by the
/// orchestrator; the returned boxes are owned by that symbol's loop alone.
pub struct StrategyFactory;

impl StrategyFactory {
    pub fn create_all() -> Vec<Box<dyn Strategy>> {
        vec![
            Box::new(TrendPullbackStrategy::new()),
            Box::new(BreakoutStrategy::new()),
            Box::new(MeanReversionStrategy::new()),
        ]
    }

    pub fn strategy_names() -> Vec<&'static str> {
        vec!["TrendPullback", "Breakout", "MeanReversion"]
    }
}
