// =============================================================================
// Position manager — per-symbol position table with pyramiding support
// =============================================================================
//
// At most one open position per symbol. Adding updates quantity and the
// size-weighted entry price and bumps the pyramid level; closing removes the
// position. Each mutation mirrors into the persistent store.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::storage::{SqliteStore, StoredPosition};
use crate::types::PositionSide;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub pyramid_level: u32,
    pub strategy_id: String,
    pub created_at: i64,
}

impl ManagedPosition {
    fn to_stored(&self) -> StoredPosition {
        StoredPosition {
            symbol: self.symbol.clone(),
            side: self.side.to_string(),
            qty: self.qty,
            entry_price: self.entry_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            pyramid_level: self.pyramid_level,
            strategy_id: Some(self.strategy_id.clone()),
            created_at: self.created_at,
        }
    }

    fn from_stored(stored: &StoredPosition) -> Option<Self> {
        let side = match stored.side.as_str() {
            "Long" => PositionSide::Long,
            "Short" => PositionSide::Short,
            other => {
                warn!(symbol = %stored.symbol, side = %other, "unknown stored position side");
                return None;
            }
        };
        Some(Self {
            symbol: stored.symbol.clone(),
            side,
            qty: stored.qty,
            entry_price: stored.entry_price,
            stop_loss: stored.stop_loss,
            take_profit: stored.take_profit,
            pyramid_level: stored.pyramid_level,
            strategy_id: stored.strategy_id.clone().unwrap_or_default(),
            created_at: stored.created_at,
        })
    }
}

pub struct PositionManager {
    positions: RwLock<HashMap<String, ManagedPosition>>,
    store: SqliteStore,
}

impl PositionManager {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Load positions previously persisted (used by state recovery).
    pub fn load_from_store(&self) -> anyhow::Result<usize> {
        let stored = self.store.positions()?;
        let mut map = self.positions.write();
        map.clear();
        for row in &stored {
            if let Some(pos) = ManagedPosition::from_stored(row) {
                map.insert(pos.symbol.clone(), pos);
            }
        }
        Ok(map.len())
    }

    /// Register a freshly opened position. Replaces any stale record for the
    /// symbol.
    pub fn register_position(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: f64,
        entry_price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        strategy_id: &str,
    ) -> ManagedPosition {
        let position = ManagedPosition {
            symbol: symbol.to_string(),
            side,
            qty,
            entry_price,
            stop_loss,
            take_profit,
            pyramid_level: 1,
            strategy_id: strategy_id.to_string(),
            created_at: Utc::now().timestamp_millis(),
        };

        info!(
            symbol,
            side = %side,
            qty,
            entry_price,
            strategy = strategy_id,
            "position registered"
        );

        if let Err(e) = self.store.upsert_position(&position.to_stored()) {
            warn!(symbol, error = %e, "failed to persist position");
        }
        self.positions
            .write()
            .insert(symbol.to_string(), position.clone());
        position
    }

    /// Pyramid into an existing position: weighted entry, summed qty,
    /// incremented pyramid level.
    pub fn add_to_position(&self, symbol: &str, add_qty: f64, fill_price: f64) -> Option<ManagedPosition> {
        let mut map = self.positions.write();
        let position = map.get_mut(symbol)?;

        let total = position.qty + add_qty;
        position.entry_price =
            (position.entry_price * position.qty + fill_price * add_qty) / total;
        position.qty = total;
        position.pyramid_level += 1;

        info!(
            symbol,
            add_qty,
            new_qty = position.qty,
            weighted_entry = position.entry_price,
            level = position.pyramid_level,
            "position increased"
        );

        let snapshot = position.clone();
        if let Err(e) = self.store.upsert_position(&snapshot.to_stored()) {
            warn!(symbol, error = %e, "failed to persist position add");
        }
        Some(snapshot)
    }

    /// Absorb a scaled-entry level fill: quantity and weighted entry update
    /// without consuming a pyramid level.
    pub fn absorb_fill(&self, symbol: &str, fill_qty: f64, fill_price: f64) -> Option<ManagedPosition> {
        let mut map = self.positions.write();
        let position = map.get_mut(symbol)?;

        let total = position.qty + fill_qty;
        position.entry_price =
            (position.entry_price * position.qty + fill_price * fill_qty) / total;
        position.qty = total;

        info!(
            symbol,
            fill_qty,
            new_qty = position.qty,
            weighted_entry = position.entry_price,
            "scaled-entry fill absorbed"
        );

        let snapshot = position.clone();
        if let Err(e) = self.store.upsert_position(&snapshot.to_stored()) {
            warn!(symbol, error = %e, "failed to persist absorbed fill");
        }
        Some(snapshot)
    }

    /// Update the stops attached to a position.
    pub fn set_stops(&self, symbol: &str, stop_loss: Option<f64>, take_profit: Option<f64>) {
        let mut map = self.positions.write();
        if let Some(position) = map.get_mut(symbol) {
            position.stop_loss = stop_loss;
            position.take_profit = take_profit;
            if let Err(e) = self.store.upsert_position(&position.to_stored()) {
                warn!(symbol, error = %e, "failed to persist stop update");
            }
        }
    }

    /// Remove the position; returns the final record.
    pub fn close_position(&self, symbol: &str) -> Option<ManagedPosition> {
        let removed = self.positions.write().remove(symbol);
        if let Some(position) = &removed {
            info!(
                symbol,
                side = %position.side,
                qty = position.qty,
                "position closed"
            );
            if let Err(e) = self.store.delete_position(symbol) {
                warn!(symbol, error = %e, "failed to delete persisted position");
            }
        }
        removed
    }

    pub fn get_position(&self, symbol: &str) -> Option<ManagedPosition> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    pub fn all_positions(&self) -> Vec<ManagedPosition> {
        self.positions.read().values().cloned().collect()
    }

    /// Sum of open notionals (qty * entry) across symbols.
    pub fn total_notional(&self) -> f64 {
        self.positions
            .read()
            .values()
            .map(|p| p.qty * p.entry_price)
            .sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, PositionManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("pm.db")).unwrap();
        (dir, PositionManager::new(store))
    }

    #[test]
    fn register_and_lookup() {
        let (_dir, pm) = manager();
        pm.register_position("BTCUSDT", PositionSide::Long, 1.0, 100.0, Some(95.0), None, "Breakout");
        assert!(pm.has_position("BTCUSDT"));
        let pos = pm.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.pyramid_level, 1);
        assert_eq!(pos.strategy_id, "Breakout");
    }

    #[test]
    fn add_updates_weighted_entry_and_level() {
        let (_dir, pm) = manager();
        pm.register_position("BTCUSDT", PositionSide::Long, 1.0, 100.0, None, None, "t");
        let updated = pm.add_to_position("BTCUSDT", 1.0, 110.0).unwrap();
        assert_eq!(updated.qty, 2.0);
        assert!((updated.entry_price - 105.0).abs() < 1e-12);
        assert_eq!(updated.pyramid_level, 2);
    }

    #[test]
    fn close_removes_and_returns() {
        let (_dir, pm) = manager();
        pm.register_position("BTCUSDT", PositionSide::Short, 2.0, 100.0, None, None, "t");
        let closed = pm.close_position("BTCUSDT").unwrap();
        assert_eq!(closed.qty, 2.0);
        assert!(!pm.has_position("BTCUSDT"));
        assert!(pm.close_position("BTCUSDT").is_none());
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("pm.db")).unwrap();
        {
            let pm = PositionManager::new(store.clone());
            pm.register_position("ETHUSDT", PositionSide::Long, 3.0, 3000.0, Some(2900.0), None, "t");
        }
        let pm2 = PositionManager::new(store);
        assert_eq!(pm2.load_from_store().unwrap(), 1);
        let pos = pm2.get_position("ETHUSDT").unwrap();
        assert_eq!(pos.qty, 3.0);
        assert_eq!(pos.side, PositionSide::Long);
    }

    #[test]
    fn total_notional_sums_positions() {
        let (_dir, pm) = manager();
        pm.register_position("BTCUSDT", PositionSide::Long, 2.0, 100.0, None, None, "t");
        pm.register_position("ETHUSDT", PositionSide::Short, 10.0, 30.0, None, None, "t");
        assert!((pm.total_notional() - 500.0).abs() < 1e-9);
    }
}
