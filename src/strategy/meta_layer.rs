// =============================================================================
// Meta-layer — regime scoring, hygiene gates, strategy routing, MTF confluence
// =============================================================================
//
// Per-tick sequence:
//   1. symbol guard (UNKNOWN must never originate from an official entry)
//   2. regime scoring
//   3. no-trade zones; a block emits a structured filter_check rejection
//   4. strategy enable/disable by regime
//   5. candidate generation from enabled strategies
//   6. confidence scaling (per-strategy, per-symbol override)
//   7. weighted routing (or plain arbitration), conflicts block
//   8. multi-timeframe confluence
//   9. the surviving signal carries strategy, regime, raw + scaled
//      confidence, and all reasons/values
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::MtfConfig;
use crate::features::FeatureFrame;
use crate::filters::{FilterContext, NoTradeZones};
use crate::market_data::TimeframeCache;
use crate::regime::{RegimeLabel, RegimeScorer, RegimeScores};
use crate::storage::SignalJournal;

use super::{ConfidenceScaler, RouteOutcome, Signal, Strategy, WeightedRouter};

pub struct MetaLayer {
    strategies: Vec<Box<dyn Strategy>>,
    scorer: RegimeScorer,
    zones: NoTradeZones,
    scaler: ConfidenceScaler,
    mtf: MtfConfig,
    timeframe_cache: Arc<TimeframeCache>,
    journal: Arc<SignalJournal>,
}

impl MetaLayer {
    pub fn new(
        strategies: Vec<Box<dyn Strategy>>,
        zones: NoTradeZones,
        scaler: ConfidenceScaler,
        mtf: MtfConfig,
        timeframe_cache: Arc<TimeframeCache>,
        journal: Arc<SignalJournal>,
    ) -> Self {
        info!(
            strategies = strategies.len(),
            mtf = mtf.enabled,
            "meta-layer initialised"
        );
        Self {
            strategies,
            scorer: RegimeScorer::new(),
            zones,
            scaler,
            mtf,
            timeframe_cache,
            journal,
        }
    }

    /// Evaluate one tick. Returns the final signal, if any survives.
    pub fn evaluate(&mut self, frame: &FeatureFrame, ctx: &FilterContext) -> Option<Signal> {
        // 1. Symbol guard.
        let symbol = if frame.symbol.trim().is_empty() {
            warn!("meta-layer received a frame without a symbol — recording as UNKNOWN");
            "UNKNOWN".to_string()
        } else {
            frame.symbol.clone()
        };

        let last = frame.last()?;

        // 2. Regime scoring.
        let scores = self.scorer.score(last);

        // 3. No-trade zones.
        let verdict = self.zones.check(frame, ctx);
        if !verdict.allowed {
            let reason = verdict.reason.unwrap_or_else(|| "blocked".to_string());
            debug!(symbol = %symbol, reason = %reason, "tick blocked by no-trade zone");
            self.journal.filter_check(&symbol, &reason, &verdict.details);
            return None;
        }

        // 4. Enable/disable by regime.
        self.adjust_strategies(scores.label);

        // 5. Candidates.
        let mut candidates: Vec<Signal> = Vec::new();
        for strategy in self.strategies.iter_mut() {
            if !strategy.is_enabled() {
                continue;
            }
            if let Some(mut signal) = strategy.generate_signal(frame) {
                signal.regime = scores.label.to_string();
                // 6. Confidence scaling.
                signal.raw_confidence = signal.confidence;
                signal.confidence =
                    self.scaler
                        .scale(&symbol, &signal.strategy, signal.raw_confidence);

                info!(
                    symbol = %symbol,
                    strategy = %signal.strategy,
                    direction = %signal.direction,
                    raw = signal.raw_confidence,
                    scaled = signal.confidence,
                    "candidate signal"
                );
                self.journal.signal_generated(
                    &symbol,
                    &signal.strategy,
                    &signal.direction.to_string(),
                    signal.confidence,
                    signal.reasons.iter().cloned().collect(),
                    &signal.values,
                );
                candidates.push(signal);
            }
        }

        // 7. Routing.
        let mut selected = match WeightedRouter::route(candidates, scores.label, 1.0) {
            RouteOutcome::Selected(signal) => signal,
            RouteOutcome::Conflict => {
                self.journal.signal_rejected(
                    &symbol,
                    "router",
                    "conflict",
                    0.0,
                    vec!["signal_conflict".to_string()],
                    &Default::default(),
                );
                return None;
            }
            RouteOutcome::Empty => return None,
        };

        // 8. MTF confluence.
        if self.mtf.enabled {
            match self
                .timeframe_cache
                .check_confluence(selected.direction, self.mtf.max_atr_pct_15m)
            {
                Some(false) => {
                    info!(symbol = %symbol, "signal rejected: no MTF confluence");
                    self.journal.signal_rejected(
                        &symbol,
                        &selected.strategy,
                        &selected.direction.to_string(),
                        selected.confidence,
                        vec!["mtf_no_confluence".to_string()],
                        &selected.values,
                    );
                    return None;
                }
                Some(true) => selected.mtf_confirmed = Some(true),
                None => {} // cache not yet warm — no confluence opinion
            }
        }

        // 9. Accepted.
        self.journal.signal_accepted(
            &symbol,
            &selected.strategy,
            &selected.direction.to_string(),
            selected.confidence,
            selected.reasons.iter().cloned().collect(),
            &selected.values,
        );
        Some(selected)
    }

    /// Strategy activation per regime: trends run TrendPullback, ranges run
    /// Breakout and MeanReversion, everything else disables all entries.
    fn adjust_strategies(&mut self, label: RegimeLabel) {
        for strategy in self.strategies.iter_mut() {
            let enabled = match strategy.name() {
                "TrendPullback" => label.is_trend(),
                "Breakout" => label == RegimeLabel::Range,
                "MeanReversion" => label == RegimeLabel::Range,
                _ => false,
            };
            strategy.set_enabled(enabled);
        }
    }

    /// The regime scores of the last evaluation are recomputed on demand for
    /// metrics consumers.
    pub fn score_only(&self, frame: &FeatureFrame) -> Option<RegimeScores> {
        frame.last().map(|row| self.scorer.score(row))
    }
}
