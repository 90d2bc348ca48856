// =============================================================================
// Signal-action handler — pure decision for signals against open positions
// =============================================================================
//
// A pure function of (current position, new signal, config) returning the
// decision the trading loop then applies. This keeps OrderManager and
// PositionManager free of each other.
//
// Decisions:
//   OpenNew — no position, the signal opens normally
//   Ignore  — conflict policy says drop the signal
//   Add     — pyramid into the position (validated)
//   Flip    — close the position and open the opposite side
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{OppositeDirectionAction, SameDirectionAction, SignalActionsConfig};
use crate::strategy::Signal;
use crate::types::Direction;

use super::position_manager::ManagedPosition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalDecision {
    /// No open position: proceed with a fresh entry.
    OpenNew,
    /// Drop the signal; the token is a stable reason for the journal.
    Ignore { reason: String },
    /// Pyramid: submit `add_qty` more in the current direction.
    Add { add_qty: f64, new_total_qty: f64 },
    /// Close the current position and open the opposite side.
    Flip { close_qty: f64 },
}

/// Decide what to do with `signal` given the current position.
pub fn decide_action(
    current: Option<&ManagedPosition>,
    signal: &Signal,
    current_price: f64,
    config: &SignalActionsConfig,
) -> SignalDecision {
    let position = match current {
        None => return SignalDecision::OpenNew,
        Some(p) => p,
    };

    if signal.direction == Direction::Close {
        return SignalDecision::Flip {
            close_qty: position.qty,
        };
    }

    let same_direction = position.side.matches_direction(signal.direction);

    if same_direction {
        match config.on_same_direction {
            SameDirectionAction::Ignore => {
                debug!(
                    symbol = %position.symbol,
                    side = %position.side,
                    "same-direction signal ignored (position_conflict)"
                );
                SignalDecision::Ignore {
                    reason: "position_conflict".to_string(),
                }
            }
            SameDirectionAction::Add => validate_add(position, signal, current_price, config),
        }
    } else {
        match config.on_opposite_direction {
            OppositeDirectionAction::Ignore => SignalDecision::Ignore {
                reason: "position_conflict".to_string(),
            },
            OppositeDirectionAction::Flip => validate_flip(position, signal, config),
        }
    }
}

/// ADD validation: confidence floor, pyramid-level cap, per-step size cap,
/// and total-exposure cap.
fn validate_add(
    position: &ManagedPosition,
    signal: &Signal,
    current_price: f64,
    config: &SignalActionsConfig,
) -> SignalDecision {
    if config.require_higher_confidence && signal.confidence < config.min_confidence_for_action {
        return SignalDecision::Ignore {
            reason: "add_confidence_too_low".to_string(),
        };
    }

    if position.pyramid_level >= config.max_pyramid_levels {
        return SignalDecision::Ignore {
            reason: "max_pyramid_levels".to_string(),
        };
    }

    let add_qty = position.qty * config.pyramid_qty_increase;
    let max_increase = position.qty * config.max_qty_increase_percent / 100.0;
    if add_qty > max_increase {
        return SignalDecision::Ignore {
            reason: "add_qty_too_large".to_string(),
        };
    }

    let new_total_qty = position.qty + add_qty;
    let new_notional = new_total_qty * current_price;
    if new_notional > config.max_total_exposure {
        return SignalDecision::Ignore {
            reason: "exposure_cap".to_string(),
        };
    }

    debug!(
        symbol = %position.symbol,
        add_qty,
        new_total_qty,
        new_notional,
        "ADD validation passed"
    );
    SignalDecision::Add {
        add_qty,
        new_total_qty,
    }
}

/// FLIP validation: the optional confidence floor only.
fn validate_flip(
    position: &ManagedPosition,
    signal: &Signal,
    config: &SignalActionsConfig,
) -> SignalDecision {
    if config.require_higher_confidence && signal.confidence < config.min_confidence_for_action {
        return SignalDecision::Ignore {
            reason: "flip_confidence_too_low".to_string(),
        };
    }

    debug!(
        symbol = %position.symbol,
        side = %position.side,
        qty = position.qty,
        "FLIP validation passed"
    );
    SignalDecision::Flip {
        close_qty: position.qty,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;

    fn position(side: PositionSide, qty: f64, pyramid_level: u32) -> ManagedPosition {
        ManagedPosition {
            symbol: "BTCUSDT".into(),
            side,
            qty,
            entry_price: 100.0,
            stop_loss: Some(95.0),
            take_profit: None,
            pyramid_level,
            strategy_id: "TrendPullback".into(),
            created_at: 0,
        }
    }

    fn signal(direction: Direction, confidence: f64) -> Signal {
        let stop = if direction == Direction::Long { 98.0 } else { 102.0 };
        Signal::new(direction, confidence, 100.0, stop, "TrendPullback")
    }

    fn config() -> SignalActionsConfig {
        SignalActionsConfig::default()
    }

    #[test]
    fn no_position_opens_new() {
        let d = decide_action(None, &signal(Direction::Long, 0.8), 100.0, &config());
        assert_eq!(d, SignalDecision::OpenNew);
    }

    #[test]
    fn default_policy_ignores_same_direction() {
        let pos = position(PositionSide::Long, 1.0, 1);
        let d = decide_action(Some(&pos), &signal(Direction::Long, 0.9), 100.0, &config());
        assert_eq!(
            d,
            SignalDecision::Ignore {
                reason: "position_conflict".to_string()
            }
        );
    }

    #[test]
    fn default_policy_ignores_opposite_direction() {
        let pos = position(PositionSide::Long, 1.0, 1);
        let d = decide_action(Some(&pos), &signal(Direction::Short, 0.9), 100.0, &config());
        assert_eq!(
            d,
            SignalDecision::Ignore {
                reason: "position_conflict".to_string()
            }
        );
    }

    #[test]
    fn add_policy_pyramids_with_half_qty() {
        let mut cfg = config();
        cfg.on_same_direction = SameDirectionAction::Add;
        let pos = position(PositionSide::Long, 2.0, 1);
        let d = decide_action(Some(&pos), &signal(Direction::Long, 0.9), 100.0, &cfg);
        assert_eq!(
            d,
            SignalDecision::Add {
                add_qty: 1.0,
                new_total_qty: 3.0
            }
        );
    }

    #[test]
    fn add_rejected_at_max_pyramid_level() {
        let mut cfg = config();
        cfg.on_same_direction = SameDirectionAction::Add;
        let pos = position(PositionSide::Long, 2.0, 3);
        let d = decide_action(Some(&pos), &signal(Direction::Long, 0.9), 100.0, &cfg);
        assert_eq!(
            d,
            SignalDecision::Ignore {
                reason: "max_pyramid_levels".to_string()
            }
        );
    }

    #[test]
    fn add_rejected_over_exposure_cap() {
        let mut cfg = config();
        cfg.on_same_direction = SameDirectionAction::Add;
        cfg.max_total_exposure = 250.0;
        let pos = position(PositionSide::Long, 2.0, 1);
        // New total 3.0 * 100 = 300 > 250.
        let d = decide_action(Some(&pos), &signal(Direction::Long, 0.9), 100.0, &cfg);
        assert_eq!(
            d,
            SignalDecision::Ignore {
                reason: "exposure_cap".to_string()
            }
        );
    }

    #[test]
    fn add_rejected_below_confidence_floor() {
        let mut cfg = config();
        cfg.on_same_direction = SameDirectionAction::Add;
        cfg.require_higher_confidence = true;
        let pos = position(PositionSide::Long, 2.0, 1);
        let d = decide_action(Some(&pos), &signal(Direction::Long, 0.5), 100.0, &cfg);
        assert_eq!(
            d,
            SignalDecision::Ignore {
                reason: "add_confidence_too_low".to_string()
            }
        );
    }

    #[test]
    fn flip_policy_closes_current_qty() {
        let mut cfg = config();
        cfg.on_opposite_direction = OppositeDirectionAction::Flip;
        let pos = position(PositionSide::Long, 2.5, 2);
        let d = decide_action(Some(&pos), &signal(Direction::Short, 0.9), 100.0, &cfg);
        assert_eq!(d, SignalDecision::Flip { close_qty: 2.5 });
    }

    #[test]
    fn flip_rejected_below_confidence_floor() {
        let mut cfg = config();
        cfg.on_opposite_direction = OppositeDirectionAction::Flip;
        cfg.require_higher_confidence = true;
        let pos = position(PositionSide::Long, 2.5, 1);
        let d = decide_action(Some(&pos), &signal(Direction::Short, 0.5), 100.0, &cfg);
        assert_eq!(
            d,
            SignalDecision::Ignore {
                reason: "flip_confidence_too_low".to_string()
            }
        );
    }

    #[test]
    fn close_signal_always_flips_out() {
        let pos = position(PositionSide::Long, 2.0, 1);
        let d = decide_action(Some(&pos), &signal(Direction::Close, 0.9), 100.0, &config());
        assert_eq!(d, SignalDecision::Flip { close_qty: 2.0 });
    }
}
