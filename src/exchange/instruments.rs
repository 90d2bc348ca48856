// =============================================================================
// Instrument registry — tick/step/min-notional rules with safe fallbacks
// =============================================================================
//
// Rules are immutable per symbol and refreshed on startup from
// /v5/market/instruments-info. When the catalog endpoint is unavailable a
// fixed fallback table covers the common symbols. A missing instrument is a
// hard failure: no order is ever normalised by guesswork.
//
// normalize_price rounds to the nearest tick (idempotent and monotone);
// normalize_qty floors to the step so size is never rounded up.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::EngineError;

use super::client::BybitRestClient;

/// Venue trading rules for one symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstrumentRule {
    pub tick_size: f64,
    pub qty_step: f64,
    pub min_order_qty: f64,
    pub max_order_qty: f64,
    pub min_notional: f64,
}

/// Fallback table used when the catalog endpoint is unavailable.
fn builtin_rules() -> HashMap<String, InstrumentRule> {
    let mut rules = HashMap::new();
    rules.insert(
        "BTCUSDT".to_string(),
        InstrumentRule {
            tick_size: 0.1,
            qty_step: 0.001,
            min_order_qty: 0.001,
            max_order_qty: 1190.0,
            min_notional: 5.0,
        },
    );
    rules.insert(
        "ETHUSDT".to_string(),
        InstrumentRule {
            tick_size: 0.01,
            qty_step: 0.01,
            min_order_qty: 0.01,
            max_order_qty: 7240.0,
            min_notional: 5.0,
        },
    );
    rules.insert(
        "SOLUSDT".to_string(),
        InstrumentRule {
            tick_size: 0.001,
            qty_step: 0.1,
            min_order_qty: 0.1,
            max_order_qty: 79_770.0,
            min_notional: 5.0,
        },
    );
    rules.insert(
        "XRPUSDT".to_string(),
        InstrumentRule {
            tick_size: 0.0001,
            qty_step: 1.0,
            min_order_qty: 1.0,
            max_order_qty: 2_480_000.0,
            min_notional: 5.0,
        },
    );
    rules
}

/// Read-mostly registry; a refresh atomically swaps in a new snapshot.
pub struct InstrumentRegistry {
    rules: RwLock<HashMap<String, InstrumentRule>>,
}

impl InstrumentRegistry {
    /// Start from the fallback table; call `refresh` to load the live catalog.
    pub fn with_fallback() -> Self {
        Self {
            rules: RwLock::new(builtin_rules()),
        }
    }

    pub fn empty() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, symbol: &str, rule: InstrumentRule) {
        self.rules.write().insert(symbol.to_string(), rule);
    }

    pub fn get(&self, symbol: &str) -> Option<InstrumentRule> {
        self.rules.read().get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Refresh from the venue catalog; on failure the current snapshot (the
    /// fallback table on first boot) stays in place.
    pub async fn refresh(&self, client: &BybitRestClient) -> anyhow::Result<usize> {
        let list = match client.get_instruments_info(None).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "instrument catalog unavailable — keeping current rules");
                return Ok(self.len());
            }
        };

        let mut fresh = HashMap::new();
        for entry in &list {
            let symbol = match entry["symbol"].as_str() {
                Some(s) => s.to_string(),
                None => continue,
            };
            let price_filter = &entry["priceFilter"];
            let lot_filter = &entry["lotSizeFilter"];

            let rule = InstrumentRule {
                tick_size: str_field(price_filter, "tickSize").unwrap_or(0.0),
                qty_step: str_field(lot_filter, "qtyStep").unwrap_or(0.0),
                min_order_qty: str_field(lot_filter, "minOrderQty").unwrap_or(0.0),
                max_order_qty: str_field(lot_filter, "maxOrderQty").unwrap_or(f64::MAX),
                min_notional: str_field(lot_filter, "minNotionalValue").unwrap_or(5.0),
            };
            if rule.tick_size > 0.0 && rule.qty_step > 0.0 {
                fresh.insert(symbol, rule);
            }
        }

        if fresh.is_empty() {
            warn!("instrument catalog returned no usable rules — keeping current snapshot");
            return Ok(self.len());
        }

        let count = fresh.len();
        *self.rules.write() = fresh;
        info!(count, "instrument registry refreshed from venue catalog");
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Normalisation
    // -------------------------------------------------------------------------

    /// Round a price to the nearest tick. Idempotent and monotone.
    pub fn normalize_price(&self, symbol: &str, price: f64) -> Result<f64, EngineError> {
        let rule = self
            .get(symbol)
            .ok_or_else(|| EngineError::Integrity(format!("no instrument rule for {symbol}")))?;
        if rule.tick_size <= 0.0 {
            return Err(EngineError::Integrity(format!(
                "invalid tick size for {symbol}"
            )));
        }
        let ticks = (price / rule.tick_size).round();
        Ok(round_dust(ticks * rule.tick_size))
    }

    /// Floor a quantity to the step (size is never rounded up).
    pub fn normalize_qty(&self, symbol: &str, qty: f64) -> Result<f64, EngineError> {
        let rule = self
            .get(symbol)
            .ok_or_else(|| EngineError::Integrity(format!("no instrument rule for {symbol}")))?;
        if rule.qty_step <= 0.0 {
            return Err(EngineError::Integrity(format!(
                "invalid qty step for {symbol}"
            )));
        }
        // A hair of tolerance so 0.3/0.1 style float error does not drop a
        // whole step.
        let steps = (qty / rule.qty_step + 1e-9).floor();
        Ok(round_dust(steps * rule.qty_step))
    }

    /// Validate a normalised (price, qty) pair against the venue minimums.
    pub fn validate(&self, symbol: &str, price: f64, qty: f64) -> Result<(), EngineError> {
        let rule = self
            .get(symbol)
            .ok_or_else(|| EngineError::Integrity(format!("no instrument rule for {symbol}")))?;

        if qty < rule.min_order_qty {
            return Err(EngineError::Integrity(format!(
                "qty {qty} below min_order_qty {} for {symbol}",
                rule.min_order_qty
            )));
        }
        if qty > rule.max_order_qty {
            return Err(EngineError::Integrity(format!(
                "qty {qty} above max_order_qty {} for {symbol}",
                rule.max_order_qty
            )));
        }
        if qty * price < rule.min_notional {
            return Err(EngineError::Integrity(format!(
                "notional {} below min_notional {} for {symbol}",
                qty * price,
                rule.min_notional
            )));
        }
        Ok(())
    }
}

fn str_field(obj: &serde_json::Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(|v| match v {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    })
}

/// Trim float dust introduced by tick/step multiplication.
fn round_dust(value: f64) -> f64 {
    (value * 1e10).round() / 1e10
}
