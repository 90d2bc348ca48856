// =============================================================================
// Signal arbitration — plain arbitrator and regime-weighted router
// =============================================================================
//
// Arbitrator (simple path): one-direction candidates pick the highest scaled
// confidence; a long+short mix is a conflict and blocks everything.
//
// Weighted router (default path): per-candidate
//   final_score = scaled_confidence * strategy_weight(regime) * mtf_multiplier
// Conflicting directions block with `signal_conflict`; otherwise argmax on
// final_score, tie-broken (within 1e-9) on scaled confidence. The weight
// tables are design constants: trend regimes favour TrendPullback/Breakout,
// range favours MeanReversion, high_vol attenuates everything.
// =============================================================================

use tracing::{info, warn};

use crate::regime::RegimeLabel;
use crate::types::Direction;

use super::Signal;

/// Score difference below which two candidates are considered tied.
const SCORE_TIE_EPSILON: f64 = 1e-9;

/// Routing result.
#[derive(Debug)]
pub enum RouteOutcome {
    Selected(Signal),
    /// Long and short candidates both present.
    Conflict,
    Empty,
}

// ---------------------------------------------------------------------------
// Arbitrator (simple path)
// ---------------------------------------------------------------------------

pub struct Arbitrator;

impl Arbitrator {
    /// Pick the best candidate, or block on a directional conflict.
    pub fn arbitrate(candidates: Vec<Signal>) -> RouteOutcome {
        if candidates.is_empty() {
            return RouteOutcome::Empty;
        }

        let has_long = candidates.iter().any(|s| s.direction == Direction::Long);
        let has_short = candidates.iter().any(|s| s.direction == Direction::Short);
        if has_long && has_short {
            warn!("signal conflict: both long and short candidates present — blocking all");
            return RouteOutcome::Conflict;
        }

        let best = candidates
            .into_iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("non-empty candidates");

        info!(
            strategy = %best.strategy,
            direction = %best.direction,
            confidence = best.confidence,
            "arbitrator selected signal"
        );
        RouteOutcome::Selected(best)
    }
}

// ---------------------------------------------------------------------------
// Weighted router (default path)
// ---------------------------------------------------------------------------

pub struct WeightedRouter;

impl WeightedRouter {
    /// Strategy weight per regime. Design constants, not configuration.
    pub fn weight(strategy: &str, regime: RegimeLabel) -> f64 {
        match regime {
            RegimeLabel::TrendUp | RegimeLabel::TrendDown => match strategy {
                "TrendPullback" => 1.0,
                "Breakout" => 0.8,
                "MeanReversion" => 0.3,
                _ => 0.5,
            },
            RegimeLabel::Range => match strategy {
                "MeanReversion" => 1.0,
                "Breakout" => 0.9,
                "TrendPullback" => 0.3,
                _ => 0.5,
            },
            RegimeLabel::HighVol => 0.2,
            RegimeLabel::Choppy | RegimeLabel::Unknown => 0.5,
        }
    }

    /// Route candidates through the weighted scoring rule.
    pub fn route(candidates: Vec<Signal>, regime: RegimeLabel, mtf_multiplier: f64) -> RouteOutcome {
        if candidates.is_empty() {
            return RouteOutcome::Empty;
        }

        let has_long = candidates.iter().any(|s| s.direction == Direction::Long);
        let has_short = candidates.iter().any(|s| s.direction == Direction::Short);
        if has_long && has_short {
            warn!(regime = %regime, "signal conflict: opposing directions — blocking all");
            return RouteOutcome::Conflict;
        }

        let mut best: Option<(f64, Signal)> = None;
        for candidate in candidates {
            let score =
                candidate.confidence * Self::weight(&candidate.strategy, regime) * mtf_multiplier;
            best = match best {
                None => Some((score, candidate)),
                Some((best_score, best_signal)) => {
                    let replace = if (score - best_score).abs() < SCORE_TIE_EPSILON {
                        candidate.confidence > best_signal.confidence
                    } else {
                        score > best_score
                    };
                    if replace {
                        Some((score, candidate))
                    } else {
                        Some((best_score, best_signal))
                    }
                }
            };
        }

        let (score, signal) = best.expect("non-empty candidates");
        info!(
            strategy = %signal.strategy,
            direction = %signal.direction,
            final_score = score,
            regime = %regime,
            "weighted router selected signal"
        );
        RouteOutcome::Selected(signal)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn signal(strategy: &str, direction: Direction, confidence: f64) -> Signal {
        Signal::new(
            direction,
            confidence,
            100.0,
            if direction == Direction::Long { 98.0 } else { 102.0 },
            strategy,
        )
    }

    #[test]
    fn empty_candidates_route_empty() {
        assert!(matches!(
            WeightedRouter::route(vec![], RegimeLabel::Range, 1.0),
            RouteOutcome::Empty
        ));
        assert!(matches!(Arbitrator::arbitrate(vec![]), RouteOutcome::Empty));
    }

    #[test]
    fn long_short_mix_is_conflict() {
        let candidates = vec![
            signal("TrendPullback", Direction::Long, 0.9),
            signal("MeanReversion", Direction::Short, 0.8),
        ];
        assert!(matches!(
            WeightedRouter::route(candidates.clone(), RegimeLabel::Range, 1.0),
            RouteOutcome::Conflict
        ));
        assert!(matches!(
            Arbitrator::arbitrate(candidates),
            RouteOutcome::Conflict
        ));
    }

    #[test]
    fn arbitrator_picks_highest_confidence() {
        let candidates = vec![
            signal("Breakout", Direction::Long, 0.7),
            signal("TrendPullback", Direction::Long, 0.9),
        ];
        match Arbitrator::arbitrate(candidates) {
            RouteOutcome::Selected(s) => assert_eq!(s.strategy, "TrendPullback"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn router_weights_regime() {
        // In a range, MeanReversion at the same confidence outweighs
        // TrendPullback (1.0 vs 0.3).
        let candidates = vec![
            signal("TrendPullback", Direction::Long, 0.8),
            signal("MeanReversion", Direction::Long, 0.8),
        ];
        match WeightedRouter::route(candidates, RegimeLabel::Range, 1.0) {
            RouteOutcome::Selected(s) => assert_eq!(s.strategy, "MeanReversion"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn router_strictly_higher_score_wins() {
        let candidates = vec![
            signal("Breakout", Direction::Long, 0.7),
            signal("Breakout", Direction::Long, 0.9),
        ];
        match WeightedRouter::route(candidates, RegimeLabel::Range, 1.0) {
            RouteOutcome::Selected(s) => assert!((s.confidence - 0.9).abs() < 1e-12),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn router_ties_break_on_confidence() {
        // Equal final scores: Breakout 0.9 weight * x == MeanReversion 1.0
        // weight * y when x = 1.0, y = 0.9; tie on score, 1.0 > 0.9 raw.
        let candidates = vec![
            signal("MeanReversion", Direction::Long, 0.9),
            signal("Breakout", Direction::Long, 1.0),
        ];
        match WeightedRouter::route(candidates, RegimeLabel::Range, 1.0) {
            RouteOutcome::Selected(s) => assert_eq!(s.strategy, "Breakout"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn high_vol_attenuates_uniformly() {
        assert!((WeightedRouter::weight("TrendPullback", RegimeLabel::HighVol) - 0.2).abs() < 1e-12);
        assert!((WeightedRouter::weight("MeanReversion", RegimeLabel::HighVol) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn trend_regime_favours_pullback() {
        let w_tp = WeightedRouter::weight("TrendPullback", RegimeLabel::TrendUp);
        let w_mr = WeightedRouter::weight("MeanReversion", RegimeLabel::TrendUp);
        assert!(w_tp > w_mr);
    }
}
