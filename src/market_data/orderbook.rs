// =============================================================================
// Local orderbook — snapshot + delta accumulation per symbol
// =============================================================================
//
// Bybit's orderbook channel delivers one `snapshot` frame followed by `delta`
// frames. Deltas received before a snapshot are discarded. A delta level with
// size 0 removes that price level.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Price-ordered orderbook snapshot: bids descending, asks ascending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    /// (price, size) sorted by price descending.
    pub bids: Vec<(f64, f64)>,
    /// (price, size) sorted by price ascending.
    pub asks: Vec<(f64, f64)>,
    /// Venue update id of the snapshot (0 when built from REST).
    pub update_id: u64,
}

impl OrderbookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|(p, _)| *p)
    }

    /// `best_ask > best_bid > 0` must hold for a usable book.
    pub fn is_valid(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid > 0.0 && ask > bid,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Delta-accumulating local book
// ---------------------------------------------------------------------------

/// Integer price key so levels can live in a BTreeMap without float-ordering
/// pitfalls. Prices are scaled by 1e8.
fn price_key(price: f64) -> i64 {
    (price * 1e8).round() as i64
}

fn key_price(key: i64) -> f64 {
    key as f64 / 1e8
}

/// One symbol's local book, maintained from WS snapshot/delta frames.
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<i64, f64>,
    asks: BTreeMap<i64, f64>,
    /// Set once the first snapshot arrives; deltas are ignored before that.
    snapshot_seen: bool,
    last_update_id: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole book with a snapshot frame.
    pub fn apply_snapshot(&mut self, snapshot: &OrderbookSnapshot) {
        self.bids.clear();
        self.asks.clear();
        for &(p, s) in &snapshot.bids {
            if s > 0.0 {
                self.bids.insert(price_key(p), s);
            }
        }
        for &(p, s) in &snapshot.asks {
            if s > 0.0 {
                self.asks.insert(price_key(p), s);
            }
        }
        self.snapshot_seen = true;
        self.last_update_id = snapshot.update_id;
    }

    /// Apply a delta frame. Returns false when the delta was dropped because
    /// no snapshot has arrived yet.
    pub fn apply_delta(&mut self, bids: &[(f64, f64)], asks: &[(f64, f64)], update_id: u64) -> bool {
        if !self.snapshot_seen {
            debug!("orderbook delta before snapshot — dropped");
            return false;
        }
        for &(p, s) in bids {
            if s == 0.0 {
                self.bids.remove(&price_key(p));
            } else {
                self.bids.insert(price_key(p), s);
            }
        }
        for &(p, s) in asks {
            if s == 0.0 {
                self.asks.remove(&price_key(p));
            } else {
                self.asks.insert(price_key(p), s);
            }
        }
        self.last_update_id = update_id;
        true
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot_seen
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|&k| key_price(k))
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|&k| key_price(k))
    }

    /// Materialise the book as a sorted snapshot, truncated to `depth` levels
    /// per side.
    pub fn snapshot(&self, depth: usize) -> OrderbookSnapshot {
        let bids: Vec<(f64, f64)> = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(&k, &s)| (key_price(k), s))
            .collect();
        let asks: Vec<(f64, f64)> = self
            .asks
            .iter()
            .take(depth)
            .map(|(&k, &s)| (key_price(k), s))
            .collect();
        OrderbookSnapshot {
            bids,
            asks,
            update_id: self.last_update_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-symbol book manager
// ---------------------------------------------------------------------------

/// Thread-safe registry of local books, one per symbol.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, OrderBook>>,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn apply_snapshot(&self, symbol: &str, snapshot: &OrderbookSnapshot) {
        let mut books = self.books.write();
        books
            .entry(symbol.to_string())
            .or_insert_with(OrderBook::new)
            .apply_snapshot(snapshot);
    }

    pub fn apply_delta(
        &self,
        symbol: &str,
        bids: &[(f64, f64)],
        asks: &[(f64, f64)],
        update_id: u64,
    ) -> bool {
        let mut books = self.books.write();
        books
            .entry(symbol.to_string())
            .or_insert_with(OrderBook::new)
            .apply_delta(bids, asks, update_id)
    }

    pub fn snapshot(&self, symbol: &str, depth: usize) -> Option<OrderbookSnapshot> {
        let books = self.books.read();
        books
            .get(symbol)
            .filter(|b| b.has_snapshot())
            .map(|b| b.snapshot(depth))
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
