// =============================================================================
// Position sizer — equity-percent risk model with hard caps
// =============================================================================
//
// qty is chosen so that qty * |entry - stop| <= equity * risk_per_trade_pct,
// rounded down to the instrument's qty step, then checked against:
//   - min_order_qty / min_notional (reject below)
//   - leverage cap (scale down and re-round, reject when below min)
//   - total exposure cap across all open symbols
//
// High-ATR% markets attenuate the risk budget. A stop on the wrong side of
// entry is an integrity failure before any arithmetic happens.
// =============================================================================

use tracing::{debug, warn};

use crate::config::RiskConfig;
use crate::errors::EngineError;
use crate::exchange::InstrumentRegistry;
use crate::types::Direction;

/// One sizing request.
#[derive(Debug, Clone)]
pub struct SizingInput<'a> {
    pub symbol: &'a str,
    pub direction: Direction,
    pub equity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    /// ATR% of the symbol, used for risk attenuation.
    pub atr_percent: f64,
    /// Sum of notionals currently open across all symbols.
    pub open_exposure: f64,
}

pub struct PositionSizer {
    config: RiskConfig,
}

impl PositionSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Compute the order quantity for a signal. Errors are integrity
    /// rejections and are never retried.
    pub fn size(
        &self,
        registry: &InstrumentRegistry,
        input: &SizingInput<'_>,
    ) -> Result<f64, EngineError> {
        if input.equity <= 0.0 {
            return Err(EngineError::Integrity("non-positive equity".into()));
        }
        if input.entry_price <= 0.0 {
            return Err(EngineError::Integrity("non-positive entry price".into()));
        }

        // Stop must be on the correct side of entry.
        match input.direction {
            Direction::Long if input.stop_loss >= input.entry_price => {
                return Err(EngineError::Integrity(
                    "long stop must be below entry".into(),
                ));
            }
            Direction::Short if input.stop_loss <= input.entry_price => {
                return Err(EngineError::Integrity(
                    "short stop must be above entry".into(),
                ));
            }
            Direction::Close => {
                return Err(EngineError::Integrity("cannot size a close signal".into()));
            }
            _ => {}
        }

        let risk_per_unit = (input.entry_price - input.stop_loss).abs();
        if risk_per_unit <= 0.0 {
            return Err(EngineError::Integrity("zero risk distance".into()));
        }

        // Risk budget, attenuated in hot markets.
        let mut risk_budget = input.equity * self.config.per_trade_pct / 100.0;
        if input.atr_percent.is_finite() && input.atr_percent > self.config.high_vol_atr_pct {
            risk_budget *= self.config.high_vol_attenuation;
            debug!(
                symbol = input.symbol,
                atr_percent = input.atr_percent,
                "high-volatility risk attenuation applied"
            );
        }

        let raw_qty = risk_budget / risk_per_unit;
        let mut qty = registry.normalize_qty(input.symbol, raw_qty)?;

        let rule = registry
            .get(input.symbol)
            .ok_or_else(|| EngineError::Integrity(format!("no instrument rule for {}", input.symbol)))?;

        if qty < rule.min_order_qty {
            return Err(EngineError::Integrity(format!(
                "sized qty {qty} below min_order_qty {}",
                rule.min_order_qty
            )));
        }
        if qty * input.entry_price < rule.min_notional {
            return Err(EngineError::Integrity(format!(
                "sized notional {} below min_notional {}",
                qty * input.entry_price,
                rule.min_notional
            )));
        }

        // Leverage cap: scale down and re-round.
        let max_notional = input.equity * self.config.max_leverage;
        if qty * input.entry_price > max_notional {
            let capped = max_notional / input.entry_price;
            qty = registry.normalize_qty(input.symbol, capped)?;
            warn!(
                symbol = input.symbol,
                qty, "quantity reduced to satisfy the leverage cap"
            );
            if qty < rule.min_order_qty {
                return Err(EngineError::Integrity(
                    "leverage cap reduced qty below minimum".into(),
                ));
            }
        }

        // Global exposure cap at submission time.
        if input.open_exposure + qty * input.entry_price > self.config.max_total_exposure {
            return Err(EngineError::Integrity(format!(
                "total exposure {} would exceed cap {}",
                input.open_exposure + qty * input.entry_price,
                self.config.max_total_exposure
            )));
        }

        debug!(
            symbol = input.symbol,
            qty,
            risk_budget,
            risk_per_unit,
            "position sized"
        );
        Ok(qty)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::InstrumentRule;

    fn registry() -> InstrumentRegistry {
        let r = InstrumentRegistry::empty();
        r.insert(
            "BTCUSDT",
            InstrumentRule {
                tick_size: 0.1,
                qty_step: 0.001,
                min_order_qty: 0.001,
                max_order_qty: 100.0,
                min_notional: 5.0,
            },
        );
        r
    }

    fn sizer() -> PositionSizer {
        PositionSizer::new(RiskConfig {
            per_trade_pct: 1.0,
            max_leverage: 5.0,
            max_total_exposure: 500_000.0,
            high_vol_atr_pct: 5.0,
            high_vol_attenuation: 0.5,
        })
    }

    fn input<'a>(entry: f64, stop: f64) -> SizingInput<'a> {
        SizingInput {
            symbol: "BTCUSDT",
            direction: Direction::Long,
            equity: 100_000.0,
            entry_price: entry,
            stop_loss: stop,
            atr_percent: 1.0,
            open_exposure: 0.0,
        }
    }

    #[test]
    fn risk_budget_bounds_qty() {
        let qty = sizer().size(&registry(), &input(50_000.0, 49_000.0)).unwrap();
        // Budget 1000 USD over a 1000 USD/unit risk: 1.0 unit.
        assert!((qty - 1.0).abs() < 1e-9);

        // Property: qty * risk <= equity * risk_pct (+ one step of rounding).
        let risk = 1_000.0;
        assert!(qty * risk <= 100_000.0 * 0.01 + 0.001 * risk);
    }

    #[test]
    fn qty_is_step_multiple() {
        let qty = sizer().size(&registry(), &input(50_000.0, 49_337.0)).unwrap();
        let steps = qty / 0.001;
        assert!((steps - steps.round()).abs() < 1e-6, "qty {qty} not step-aligned");
    }

    #[test]
    fn wrong_side_stop_rejected() {
        let s = sizer();
        let r = registry();
        let mut bad = input(50_000.0, 51_000.0);
        assert!(s.size(&r, &bad).is_err());

        bad.direction = Direction::Short;
        bad.stop_loss = 49_000.0;
        assert!(s.size(&r, &bad).is_err());
    }

    #[test]
    fn short_sizing_mirrors() {
        let mut i = input(50_000.0, 51_000.0);
        i.direction = Direction::Short;
        let qty = sizer().size(&registry(), &i).unwrap();
        assert!((qty - 1.0).abs() < 1e-9);
    }

    #[test]
    fn leverage_cap_scales_down() {
        // Tight stop implies a huge raw qty; the leverage cap bounds it.
        let mut i = input(50_000.0, 49_990.0);
        i.equity = 10_000.0;
        let qty = sizer().size(&registry(), &i).unwrap();
        // Cap: 10_000 * 5 / 50_000 = 1.0.
        assert!(qty <= 1.0 + 1e-9);
        assert!(qty >= 0.999);
    }

    #[test]
    fn exposure_cap_rejects() {
        let mut i = input(50_000.0, 49_000.0);
        i.open_exposure = 499_000.0;
        // New notional ~50_000 would blow through the 500_000 cap.
        assert!(sizer().size(&registry(), &i).is_err());
    }

    #[test]
    fn dust_quantity_rejected() {
        let mut i = input(50_000.0, 49_000.0);
        // Budget 0.1 USD over a 1000 USD/unit risk floors to zero quantity.
        i.equity = 10.0;
        let result = sizer().size(&registry(), &i);
        assert!(result.is_err());
    }

    #[test]
    fn high_atr_attenuates_risk() {
        let normal = sizer().size(&registry(), &input(50_000.0, 49_000.0)).unwrap();
        let mut hot = input(50_000.0, 49_000.0);
        hot.atr_percent = 8.0;
        let attenuated = sizer().size(&registry(), &hot).unwrap();
        assert!((attenuated - normal * 0.5).abs() < 0.001);
    }

    #[test]
    fn close_direction_rejected() {
        let mut i = input(50_000.0, 49_000.0);
        i.direction = Direction::Close;
        assert!(sizer().size(&registry(), &i).is_err());
    }
}
