// =============================================================================
// Scaled entry — splitting a target position across conditional levels
// =============================================================================
//
// The volatility profile (chosen by ATR% band) decides how many levels and
// their shares:
//   low    (ATR% < 2):  60 / 40
//   medium (2..5):      50 / 30 / 20
//   high   (>= 5):      40 / 30 / 20 / 10
//
// Level k+1 arms only after level k executed and its trigger fired:
//   immediate          — place at once
//   confirm_profit(kR) — price moved k risk units in favour
//   pullback(kATR)     — price retraced k ATR from entry
//
// Unexecuted levels older than the timeout are cancelled. The sum of filled
// quantities equals the position quantity and the weighted average of fill
// prices equals the position entry price.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ScaledEntryConfig;
use crate::types::PositionSide;

/// Assumed stop distance in ATRs when converting R units to price.
const ASSUMED_SL_ATR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    Immediate,
    /// Price moved this many risk units in favour.
    ConfirmProfit(f64),
    /// Price retraced this many ATRs from entry.
    Pullback(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryLevel {
    pub number: u32,
    pub percent_of_total: f64,
    pub trigger: TriggerCondition,
    pub executed: bool,
    pub order_id: Option<String>,
    pub filled_qty: f64,
    pub filled_price: Option<f64>,
}

/// What the caller should do about the next unexecuted level.
#[derive(Debug, Clone, PartialEq)]
pub enum LevelAction {
    /// Place the level's order now at the current price.
    PlaceNow { level_number: u32, qty: f64 },
    /// Trigger price not reached yet.
    Wait { level_number: u32, trigger_price: f64 },
}

struct ActiveEntry {
    levels: Vec<EntryLevel>,
    total_qty: f64,
    entry_price: f64,
    atr: f64,
    side: PositionSide,
    armed_at: Instant,
}

pub struct ScaledEntryManager {
    config: ScaledEntryConfig,
    entries: Mutex<HashMap<String, ActiveEntry>>,
}

impl ScaledEntryManager {
    pub fn new(config: ScaledEntryConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Profile name for an ATR% band.
    fn profile(atr_percent: f64) -> &'static [(f64, TriggerCondition)] {
        if atr_percent < 2.0 {
            &[
                (60.0, TriggerCondition::Immediate),
                (40.0, TriggerCondition::ConfirmProfit(0.5)),
            ]
        } else if atr_percent < 5.0 {
            &[
                (50.0, TriggerCondition::Immediate),
                (30.0, TriggerCondition::Pullback(0.3)),
                (20.0, TriggerCondition::ConfirmProfit(0.5)),
            ]
        } else {
            &[
                (40.0, TriggerCondition::Immediate),
                (30.0, TriggerCondition::Pullback(0.5)),
                (20.0, TriggerCondition::ConfirmProfit(0.5)),
                (10.0, TriggerCondition::ConfirmProfit(1.0)),
            ]
        }
    }

    /// Build the entry plan for a new position. When scaled entry is disabled
    /// the plan is a single immediate level for the full size.
    pub fn plan_entry(
        &self,
        position_id: &str,
        total_qty: f64,
        atr_percent: f64,
        entry_price: f64,
        atr: f64,
        side: PositionSide,
    ) -> Vec<EntryLevel> {
        let levels: Vec<EntryLevel> = if !self.config.enabled {
            vec![EntryLevel {
                number: 1,
                percent_of_total: 100.0,
                trigger: TriggerCondition::Immediate,
                executed: false,
                order_id: None,
                filled_qty: 0.0,
                filled_price: None,
            }]
        } else {
            let profile = Self::profile(atr_percent);
            info!(
                position_id,
                atr_percent,
                levels = profile.len(),
                "scaled-entry profile selected"
            );

            profile
                .iter()
                .enumerate()
                .filter_map(|(i, (percent, trigger))| {
                    let level_qty = total_qty * percent / 100.0;
                    let notional = level_qty * entry_price;
                    if notional < self.config.min_level_notional {
                        warn!(
                            position_id,
                            level = i + 1,
                            notional,
                            "level notional below minimum — skipped"
                        );
                        return None;
                    }
                    Some(EntryLevel {
                        number: (i + 1) as u32,
                        percent_of_total: *percent,
                        trigger: *trigger,
                        executed: false,
                        order_id: None,
                        filled_qty: 0.0,
                        filled_price: None,
                    })
                })
                .collect()
        };

        self.entries.lock().insert(
            position_id.to_string(),
            ActiveEntry {
                levels: levels.clone(),
                total_qty,
                entry_price,
                atr,
                side,
                armed_at: Instant::now(),
            },
        );

        levels
    }

    /// Next unexecuted level and whether its trigger fired at `current_price`.
    pub fn next_action(&self, position_id: &str, current_price: f64) -> Option<LevelAction> {
        let entries = self.entries.lock();
        let entry = entries.get(position_id)?;

        let next = entry.levels.iter().find(|l| !l.executed)?;
        let qty = entry.total_qty * next.percent_of_total / 100.0;

        match next.trigger {
            TriggerCondition::Immediate => Some(LevelAction::PlaceNow {
                level_number: next.number,
                qty,
            }),
            TriggerCondition::ConfirmProfit(r_units) => {
                let sl_distance = entry.atr * ASSUMED_SL_ATR;
                let target = sl_distance * r_units;
                let (trigger_price, fired) = match entry.side {
                    PositionSide::Long => {
                        let t = entry.entry_price + target;
                        (t, current_price >= t)
                    }
                    PositionSide::Short => {
                        let t = entry.entry_price - target;
                        (t, current_price <= t)
                    }
                };
                if fired {
                    Some(LevelAction::PlaceNow {
                        level_number: next.number,
                        qty,
                    })
                } else {
                    Some(LevelAction::Wait {
                        level_number: next.number,
                        trigger_price,
                    })
                }
            }
            TriggerCondition::Pullback(atr_units) => {
                let distance = entry.atr * atr_units.abs();
                let (trigger_price, fired) = match entry.side {
                    PositionSide::Long => {
                        let t = entry.entry_price - distance;
                        (t, current_price <= t)
                    }
                    PositionSide::Short => {
                        let t = entry.entry_price + distance;
                        (t, current_price >= t)
                    }
                };
                if fired {
                    Some(LevelAction::PlaceNow {
                        level_number: next.number,
                        qty,
                    })
                } else {
                    Some(LevelAction::Wait {
                        level_number: next.number,
                        trigger_price,
                    })
                }
            }
        }
    }

    /// Mark a level as executed.
    pub fn mark_executed(
        &self,
        position_id: &str,
        level_number: u32,
        order_id: &str,
        filled_qty: f64,
        filled_price: f64,
    ) -> bool {
        let mut entries = self.entries.lock();
        let entry = match entries.get_mut(position_id) {
            Some(e) => e,
            None => {
                warn!(position_id, "mark_executed for unknown position");
                return false;
            }
        };

        for level in entry.levels.iter_mut() {
            if level.number == level_number {
                level.executed = true;
                level.order_id = Some(order_id.to_string());
                level.filled_qty = filled_qty;
                level.filled_price = Some(filled_price);
                info!(
                    position_id,
                    level_number, filled_qty, filled_price, "entry level executed"
                );
                return true;
            }
        }
        warn!(position_id, level_number, "entry level not found");
        false
    }

    /// Whether the plan has outlived the level timeout with pending levels.
    pub fn is_expired(&self, position_id: &str) -> bool {
        let entries = self.entries.lock();
        match entries.get(position_id) {
            Some(entry) => {
                entry.levels.iter().any(|l| !l.executed)
                    && entry.armed_at.elapsed()
                        > Duration::from_secs(self.config.level_timeout_minutes * 60)
            }
            None => false,
        }
    }

    /// Drop pending (unexecuted) levels; returns how many were cancelled.
    pub fn cancel_pending(&self, position_id: &str) -> usize {
        let mut entries = self.entries.lock();
        match entries.get_mut(position_id) {
            Some(entry) => {
                let before = entry.levels.len();
                entry.levels.retain(|l| l.executed);
                let cancelled = before - entry.levels.len();
                if cancelled > 0 {
                    debug!(position_id, cancelled, "pending entry levels cancelled");
                }
                cancelled
            }
            None => 0,
        }
    }

    /// Total filled quantity across executed levels.
    pub fn total_filled_qty(&self, position_id: &str) -> f64 {
        let entries = self.entries.lock();
        entries
            .get(position_id)
            .map(|e| e.levels.iter().filter(|l| l.executed).map(|l| l.filled_qty).sum())
            .unwrap_or(0.0)
    }

    /// Quantity-weighted average fill price across executed levels.
    pub fn average_entry_price(&self, position_id: &str) -> Option<f64> {
        let entries = self.entries.lock();
        let entry = entries.get(position_id)?;

        let mut cost = 0.0;
        let mut qty = 0.0;
        for level in entry.levels.iter().filter(|l| l.executed) {
            let price = level.filled_price?;
            cost += level.filled_qty * price;
            qty += level.filled_qty;
        }
        if qty == 0.0 {
            return None;
        }
        Some(cost / qty)
    }

    /// Forget a position's plan (after close).
    pub fn cleanup(&self, position_id: &str) {
        self.entries.lock().remove(position_id);
    }
}
