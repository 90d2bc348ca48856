// =============================================================================
// Embedded relational store — one SQLite file per deployment
// =============================================================================
//
// Concurrency contract:
//   - write-ahead journaling so readers do not block writers
//   - busy timeout of 5 seconds under lock
//   - at most ONE connection per database file per process; every handle
//     shares it. The orchestrator must never open N independent connections
//     to the same file.
//   - dropping a handle decrements the share count; the underlying connection
//     closes only when the last handle is released.
//
// Tables: orders, positions, executions, signals, errors, config_flags,
// position_snapshots.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Busy timeout under write contention (milliseconds).
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Marker code for the legacy errors-table halt indicator.
const LEGACY_HALT_CODE: &str = "KILL_SWITCH_HALT";

/// Key of the kill-switch mirror in `config_flags`.
pub const TRADING_DISABLED_FLAG: &str = "trading_disabled";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_id      TEXT PRIMARY KEY,
    order_link_id TEXT,
    symbol        TEXT NOT NULL,
    side          TEXT NOT NULL,
    order_type    TEXT NOT NULL,
    price         REAL,
    qty           REAL NOT NULL,
    filled_qty    REAL NOT NULL DEFAULT 0,
    status        TEXT NOT NULL,
    time_in_force TEXT,
    created_time  INTEGER,
    updated_time  INTEGER,
    raw           TEXT
);

CREATE TABLE IF NOT EXISTS positions (
    symbol        TEXT PRIMARY KEY,
    side          TEXT NOT NULL,
    qty           REAL NOT NULL,
    entry_price   REAL NOT NULL,
    stop_loss     REAL,
    take_profit   REAL,
    pyramid_level INTEGER NOT NULL DEFAULT 1,
    strategy_id   TEXT,
    created_at    INTEGER
);

CREATE TABLE IF NOT EXISTS executions (
    exec_id   TEXT PRIMARY KEY,
    order_id  TEXT,
    symbol    TEXT NOT NULL,
    side      TEXT,
    qty       REAL,
    price     REAL,
    exec_time INTEGER
);

CREATE TABLE IF NOT EXISTS signals (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol     TEXT NOT NULL,
    strategy   TEXT,
    direction  TEXT,
    confidence REAL,
    accepted   INTEGER NOT NULL,
    payload    TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS errors (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol     TEXT,
    kind       TEXT NOT NULL,
    code       TEXT,
    message    TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS config_flags (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS position_snapshots (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol     TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_symbol  ON orders(symbol, status);
CREATE INDEX IF NOT EXISTS idx_errors_created ON errors(created_at);
CREATE INDEX IF NOT EXISTS idx_signals_symbol ON signals(symbol, created_at);
"#;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredOrder {
    pub order_id: String,
    pub order_link_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub price: Option<f64>,
    pub qty: f64,
    pub filled_qty: f64,
    pub status: String,
    pub time_in_force: Option<String>,
    pub created_time: i64,
    pub updated_time: i64,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPosition {
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub pyramid_level: u32,
    pub strategy_id: Option<String>,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Process-local connection cache
// ---------------------------------------------------------------------------

struct StoreShared {
    path: PathBuf,
    conn: Mutex<Connection>,
}

fn connection_cache() -> &'static Mutex<HashMap<PathBuf, Weak<StoreShared>>> {
    static CACHE: OnceLock<Mutex<HashMap<PathBuf, Weak<StoreShared>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cache_key(path: &Path) -> PathBuf {
    // Canonicalise when the file already exists so "./db" and "db" share a
    // connection; fall back to the raw path for a file not yet created.
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// A handle to the shared per-file connection. Cloning creates another handle;
/// the connection closes when the last handle drops.
#[derive(Clone)]
pub struct SqliteStore {
    shared: Arc<StoreShared>,
}

impl SqliteStore {
    /// Open (or join) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let key = cache_key(path.as_ref());

        let mut cache = connection_cache().lock();
        if let Some(existing) = cache.get(&key).and_then(Weak::upgrade) {
            debug!(path = %key.display(), handles = Arc::strong_count(&existing), "joining cached store connection");
            return Ok(Self { shared: existing });
        }

        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open sqlite db at {}", key.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous mode")?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
            .context("failed to set busy timeout")?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply store schema")?;

        info!(path = %key.display(), "sqlite store opened (WAL, busy_timeout=5s)");

        let shared = Arc::new(StoreShared {
            path: key.clone(),
            conn: Mutex::new(conn),
        });
        // Re-key on the canonical path now that the file exists.
        let canonical = cache_key(&key);
        cache.insert(canonical, Arc::downgrade(&shared));

        Ok(Self { shared })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Number of live handles sharing this connection.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub fn upsert_order(&self, order: &StoredOrder) -> Result<()> {
        let conn = self.shared.conn.lock();
        conn.execute(
            "INSERT INTO orders (order_id, order_link_id, symbol, side, order_type, price, qty,
                                 filled_qty, status, time_in_force, created_time, updated_time, raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(order_id) DO UPDATE SET
                 filled_qty = excluded.filled_qty,
                 status = excluded.status,
                 updated_time = excluded.updated_time,
                 raw = excluded.raw",
            params![
                order.order_id,
                order.order_link_id,
                order.symbol,
                order.side,
                order.order_type,
                order.price,
                order.qty,
                order.filled_qty,
                order.status,
                order.time_in_force,
                order.created_time,
                order.updated_time,
                order.raw,
            ],
        )
        .context("failed to upsert order")?;
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> Result<Option<StoredOrder>> {
        let conn = self.shared.conn.lock();
        conn.query_row(
            "SELECT order_id, order_link_id, symbol, side, order_type, price, qty, filled_qty,
                    status, time_in_force, created_time, updated_time, raw
             FROM orders WHERE order_id = ?1",
            params![order_id],
            Self::order_from_row,
        )
        .optional()
        .context("failed to query order")
    }

    pub fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<StoredOrder>> {
        let conn = self.shared.conn.lock();
        let mut out = Vec::new();
        let mut push = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            out.push(Self::order_from_row(row)?);
            Ok(())
        };
        match symbol {
            Some(sym) => {
                let mut stmt = conn.prepare(
                    "SELECT order_id, order_link_id, symbol, side, order_type, price, qty,
                            filled_qty, status, time_in_force, created_time, updated_time, raw
                     FROM orders WHERE symbol = ?1 AND status IN ('New', 'PartiallyFilled')",
                )?;
                let mut rows = stmt.query(params![sym])?;
                while let Some(row) = rows.next()? {
                    push(row)?;
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT order_id, order_link_id, symbol, side, order_type, price, qty,
                            filled_qty, status, time_in_force, created_time, updated_time, raw
                     FROM orders WHERE status IN ('New', 'PartiallyFilled')",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    push(row)?;
                }
            }
        }
        Ok(out)
    }

    fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredOrder> {
        Ok(StoredOrder {
            order_id: row.get(0)?,
            order_link_id: row.get(1)?,
            symbol: row.get(2)?,
            side: row.get(3)?,
            order_type: row.get(4)?,
            price: row.get(5)?,
            qty: row.get(6)?,
            filled_qty: row.get(7)?,
            status: row.get(8)?,
            time_in_force: row.get(9)?,
            created_time: row.get(10)?,
            updated_time: row.get(11)?,
            raw: row.get(12)?,
        })
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub fn upsert_position(&self, position: &StoredPosition) -> Result<()> {
        let conn = self.shared.conn.lock();
        conn.execute(
            "INSERT INTO positions (symbol, side, qty, entry_price, stop_loss, take_profit,
                                    pyramid_level, strategy_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(symbol) DO UPDATE SET
                 side = excluded.side,
                 qty = excluded.qty,
                 entry_price = excluded.entry_price,
                 stop_loss = excluded.stop_loss,
                 take_profit = excluded.take_profit,
                 pyramid_level = excluded.pyramid_level,
                 strategy_id = excluded.strategy_id",
            params![
                position.symbol,
                position.side,
                position.qty,
                position.entry_price,
                position.stop_loss,
                position.take_profit,
                position.pyramid_level,
                position.strategy_id,
                position.created_at,
            ],
        )
        .context("failed to upsert position")?;
        Ok(())
    }

    pub fn delete_position(&self, symbol: &str) -> Result<()> {
        let conn = self.shared.conn.lock();
        conn.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])
            .context("failed to delete position")?;
        Ok(())
    }

    pub fn positions(&self) -> Result<Vec<StoredPosition>> {
        let conn = self.shared.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, side, qty, entry_price, stop_loss, take_profit, pyramid_level,
                    strategy_id, created_at
             FROM positions",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredPosition {
                symbol: row.get(0)?,
                side: row.get(1)?,
                qty: row.get(2)?,
                entry_price: row.get(3)?,
                stop_loss: row.get(4)?,
                take_profit: row.get(5)?,
                pyramid_level: row.get(6)?,
                strategy_id: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to query positions")
    }

    /// Sum of |qty * entry_price| across all stored positions, used for the
    /// global exposure cap at submission time.
    pub fn total_open_notional(&self) -> Result<f64> {
        let conn = self.shared.conn.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(ABS(qty * entry_price)), 0) FROM positions",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn insert_position_snapshot(&self, symbol: &str, payload: &str) -> Result<()> {
        let conn = self.shared.conn.lock();
        conn.execute(
            "INSERT INTO position_snapshots (symbol, payload, created_at) VALUES (?1, ?2, ?3)",
            params![symbol, payload, Self::now_ms()],
        )
        .context("failed to insert position snapshot")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Executions
    // -------------------------------------------------------------------------

    pub fn insert_execution(
        &self,
        exec_id: &str,
        order_id: &str,
        symbol: &str,
        side: &str,
        qty: f64,
        price: f64,
        exec_time: i64,
    ) -> Result<bool> {
        let conn = self.shared.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO executions (exec_id, order_id, symbol, side, qty, price, exec_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![exec_id, order_id, symbol, side, qty, price, exec_time],
        )?;
        Ok(inserted > 0)
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    pub fn insert_signal(
        &self,
        symbol: &str,
        strategy: &str,
        direction: &str,
        confidence: f64,
        accepted: bool,
        payload: &str,
    ) -> Result<()> {
        let conn = self.shared.conn.lock();
        conn.execute(
            "INSERT INTO signals (symbol, strategy, direction, confidence, accepted, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                symbol,
                strategy,
                direction,
                confidence,
                accepted as i64,
                payload,
                Self::now_ms()
            ],
        )
        .context("failed to insert signal")?;
        Ok(())
    }

    pub fn signal_count(&self) -> Result<i64> {
        let conn = self.shared.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM signals", [], |row| row.get(0))?;
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Errors
    // -------------------------------------------------------------------------

    pub fn insert_error(
        &self,
        symbol: Option<&str>,
        kind: &str,
        code: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let conn = self.shared.conn.lock();
        conn.execute(
            "INSERT INTO errors (symbol, kind, code, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![symbol, kind, code, message, Self::now_ms()],
        )
        .context("failed to insert error")?;
        Ok(())
    }

    /// Count of errors recorded in the last `window_secs` seconds.
    pub fn recent_error_count(&self, window_secs: i64) -> Result<u32> {
        let conn = self.shared.conn.lock();
        let cutoff = Self::now_ms() - window_secs * 1000;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM errors WHERE created_at >= ?1 AND code IS NOT ?2",
            params![cutoff, LEGACY_HALT_CODE],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // -------------------------------------------------------------------------
    // Config flags & the two halt indicators
    // -------------------------------------------------------------------------

    pub fn set_flag(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.shared.conn.lock();
        conn.execute(
            "INSERT INTO config_flags (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Self::now_ms()],
        )
        .context("failed to set config flag")?;
        Ok(())
    }

    pub fn get_flag(&self, key: &str) -> Result<Option<String>> {
        let conn = self.shared.conn.lock();
        conn.query_row(
            "SELECT value FROM config_flags WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read config flag")
    }

    pub fn delete_flag(&self, key: &str) -> Result<()> {
        let conn = self.shared.conn.lock();
        conn.execute("DELETE FROM config_flags WHERE key = ?1", params![key])
            .context("failed to delete config flag")?;
        Ok(())
    }

    /// Legacy halt indicator: a marker row in the errors table. Kept for
    /// compatibility; reset must clear it along with the config flag.
    pub fn write_legacy_halt(&self, reason: &str) -> Result<()> {
        self.insert_error(None, "kill_switch", Some(LEGACY_HALT_CODE), reason)
    }

    pub fn legacy_halt_present(&self) -> Result<bool> {
        let conn = self.shared.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM errors WHERE code = ?1",
            params![LEGACY_HALT_CODE],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn clear_legacy_halt(&self) -> Result<()> {
        let conn = self.shared.conn.lock();
        conn.execute("DELETE FROM errors WHERE code = ?1", params![LEGACY_HALT_CODE])
            .context("failed to clear legacy halt indicator")?;
        Ok(())
    }

    /// The kill switch is considered persisted-active when EITHER indicator is
    /// set.
    pub fn trading_disabled(&self) -> Result<bool> {
        let flag = self
            .get_flag(TRADING_DISABLED_FLAG)?
            .map(|v| v == "true")
            .unwrap_or(false);
        Ok(flag || self.legacy_halt_present()?)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.shared.path)
            .field("handles", &self.handle_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn same_path_shares_one_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let a = SqliteStore::open(&path).unwrap();
        let b = SqliteStore::open(&path).unwrap();
        assert_eq!(a.handle_count(), 2);
        assert_eq!(b.handle_count(), 2);
        drop(a);
        assert_eq!(b.handle_count(), 1);
    }

    #[test]
    fn order_upsert_and_reload() {
        let (_dir, store) = open_temp();
        let mut order = StoredOrder {
            order_id: "o-1".into(),
            order_link_id: Some("link-1".into()),
            symbol: "BTCUSDT".into(),
            side: "Buy".into(),
            order_type: "Limit".into(),
            price: Some(50_000.0),
            qty: 0.1,
            filled_qty: 0.0,
            status: "New".into(),
            time_in_force: Some("GTC".into()),
            created_time: 1,
            updated_time: 1,
            raw: None,
        };
        store.upsert_order(&order).unwrap();

        order.status = "Filled".into();
        order.filled_qty = 0.1;
        order.updated_time = 2;
        store.upsert_order(&order).unwrap();

        let loaded = store.get_order("o-1").unwrap().unwrap();
        assert_eq!(loaded.status, "Filled");
        assert!((loaded.filled_qty - 0.1).abs() < 1e-12);
        assert!(store.open_orders(Some("BTCUSDT")).unwrap().is_empty());
    }

    #[test]
    fn position_roundtrip_and_notional() {
        let (_dir, store) = open_temp();
        store
            .upsert_position(&StoredPosition {
                symbol: "BTCUSDT".into(),
                side: "Long".into(),
                qty: 2.0,
                entry_price: 50_000.0,
                stop_loss: Some(49_000.0),
                take_profit: None,
                pyramid_level: 1,
                strategy_id: Some("TrendPullback".into()),
                created_at: 0,
            })
            .unwrap();
        store
            .upsert_position(&StoredPosition {
                symbol: "ETHUSDT".into(),
                side: "Short".into(),
                qty: 15.0,
                entry_price: 3_000.0,
                stop_loss: None,
                take_profit: None,
                pyramid_level: 1,
                strategy_id: None,
                created_at: 0,
            })
            .unwrap();

        assert_eq!(store.positions().unwrap().len(), 2);
        let notional = store.total_open_notional().unwrap();
        assert!((notional - (100_000.0 + 45_000.0)).abs() < 1e-6);

        store.delete_position("BTCUSDT").unwrap();
        assert_eq!(store.positions().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_execution_ignored() {
        let (_dir, store) = open_temp();
        assert!(store
            .insert_execution("e-1", "o-1", "BTCUSDT", "Buy", 0.1, 50_000.0, 1)
            .unwrap());
        assert!(!store
            .insert_execution("e-1", "o-1", "BTCUSDT", "Buy", 0.1, 50_000.0, 1)
            .unwrap());
    }

    #[test]
    fn flags_and_dual_halt_indicators() {
        let (_dir, store) = open_temp();
        assert!(!store.trading_disabled().unwrap());

        store.set_flag(TRADING_DISABLED_FLAG, "true").unwrap();
        assert!(store.trading_disabled().unwrap());

        store.set_flag(TRADING_DISABLED_FLAG, "false").unwrap();
        assert!(!store.trading_disabled().unwrap());

        // Legacy indicator alone also reads as disabled.
        store.write_legacy_halt("equity_drop").unwrap();
        assert!(store.trading_disabled().unwrap());
        store.clear_legacy_halt().unwrap();
        assert!(!store.trading_disabled().unwrap());
    }

    #[test]
    fn recent_errors_windowed() {
        let (_dir, store) = open_temp();
        store
            .insert_error(Some("BTCUSDT"), "network", None, "timeout")
            .unwrap();
        store
            .insert_error(Some("BTCUSDT"), "network", None, "timeout")
            .unwrap();
        assert_eq!(store.recent_error_count(60).unwrap(), 2);
        assert_eq!(store.recent_error_count(0).unwrap(), 2); // same ms window
    }

    #[test]
    fn legacy_halt_rows_do_not_count_as_errors() {
        let (_dir, store) = open_temp();
        store.write_legacy_halt("halt").unwrap();
        assert_eq!(store.recent_error_count(60).unwrap(), 0);
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concurrent.db");

        let writers = 8;
        let per_writer = 50;
        let mut handles = Vec::new();
        for w in 0..writers {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let store = SqliteStore::open(&path).unwrap();
                for i in 0..per_writer {
                    store
                        .insert_signal("BTCUSDT", "Breakout", "long", 0.8, true, &format!("{w}-{i}"))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.signal_count().unwrap(), (writers * per_writer) as i64);
    }
}
