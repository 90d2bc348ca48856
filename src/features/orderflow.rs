// =============================================================================
// Order-flow features derived from the orderbook snapshot
// =============================================================================
//
// Computed exactly once, inside the feature pipeline; downstream consumers
// (no-trade zones, regime scorer, strategies) read these values and never
// recompute them.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::market_data::OrderbookSnapshot;

/// Levels per side used for the depth-imbalance sum.
const DEPTH_LEVELS: usize = 10;
/// Levels per side used for the concentration numerator.
const CONCENTRATION_LEVELS: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderflowFeatures {
    pub spread: f64,
    pub spread_percent: f64,
    pub midprice: f64,
    /// (Σ top-10 bid − Σ top-10 ask) / Σ top-10, in [-1, 1].
    pub depth_imbalance: f64,
    /// Top-5 volume share of top-10 volume.
    pub liquidity_concentration: f64,
}

impl OrderflowFeatures {
    /// Derive features from a sorted snapshot. Returns `None` for an empty or
    /// crossed book.
    pub fn from_snapshot(snapshot: &OrderbookSnapshot) -> Option<Self> {
        if !snapshot.is_valid() {
            warn!("orderbook snapshot invalid or empty, skipping orderflow features");
            return None;
        }

        let best_bid = snapshot.best_bid()?;
        let best_ask = snapshot.best_ask()?;

        let spread = best_ask - best_bid;
        let spread_percent = spread / best_bid * 100.0;
        let midprice = (best_bid + best_ask) / 2.0;

        let bid_volume: f64 = snapshot.bids.iter().take(DEPTH_LEVELS).map(|(_, s)| s).sum();
        let ask_volume: f64 = snapshot.asks.iter().take(DEPTH_LEVELS).map(|(_, s)| s).sum();
        let total = bid_volume + ask_volume;

        let depth_imbalance = if total > 0.0 {
            (bid_volume - ask_volume) / total
        } else {
            0.0
        };

        let top5: f64 = snapshot
            .bids
            .iter()
            .take(CONCENTRATION_LEVELS)
            .map(|(_, s)| s)
            .sum::<f64>()
            + snapshot
                .asks
                .iter()
                .take(CONCENTRATION_LEVELS)
                .map(|(_, s)| s)
                .sum::<f64>();
        let liquidity_concentration = if total > 0.0 { top5 / total } else { 0.0 };

        Some(Self {
            spread,
            spread_percent,
            midprice,
            depth_imbalance,
            liquidity_concentration,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn book(bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) -> OrderbookSnapshot {
        OrderbookSnapshot {
            bids,
            asks,
            update_id: 1,
        }
    }

    #[test]
    fn empty_book_yields_none() {
        assert!(OrderflowFeatures::from_snapshot(&OrderbookSnapshot::default()).is_none());
    }

    #[test]
    fn spread_and_midprice() {
        let snap = book(vec![(100.0, 1.0)], vec![(100.5, 1.0)]);
        let f = OrderflowFeatures::from_snapshot(&snap).unwrap();
        assert!((f.spread - 0.5).abs() < 1e-12);
        assert!((f.spread_percent - 0.5).abs() < 1e-12);
        assert!((f.midprice - 100.25).abs() < 1e-12);
    }

    #[test]
    fn balanced_book_has_zero_imbalance() {
        let snap = book(vec![(100.0, 5.0), (99.5, 5.0)], vec![(100.5, 5.0), (101.0, 5.0)]);
        let f = OrderflowFeatures::from_snapshot(&snap).unwrap();
        assert!(f.depth_imbalance.abs() < 1e-12);
    }

    #[test]
    fn bid_heavy_book_has_positive_imbalance() {
        let snap = book(vec![(100.0, 30.0)], vec![(100.5, 10.0)]);
        let f = OrderflowFeatures::from_snapshot(&snap).unwrap();
        assert!((f.depth_imbalance - 0.5).abs() < 1e-12);
    }

    #[test]
    fn imbalance_reproducible_by_independent_computation() {
        let snap = book(
            vec![(100.0, 3.0), (99.9, 2.0), (99.8, 1.0)],
            vec![(100.1, 2.0), (100.2, 2.0)],
        );
        let f = OrderflowFeatures::from_snapshot(&snap).unwrap();

        let bid_sum = 3.0 + 2.0 + 1.0;
        let ask_sum = 2.0 + 2.0;
        let expected = (bid_sum - ask_sum) / (bid_sum + ask_sum);
        assert!((f.depth_imbalance - expected).abs() < 1e-12);
        assert!(f.spread > 0.0);
    }

    #[test]
    fn concentration_counts_top_five_share() {
        // 6 bid levels of 1.0 each, 6 ask levels of 1.0 each.
        let bids: Vec<(f64, f64)> = (0..6).map(|i| (100.0 - i as f64 * 0.1, 1.0)).collect();
        let asks: Vec<(f64, f64)> = (0..6).map(|i| (100.1 + i as f64 * 0.1, 1.0)).collect();
        let f = OrderflowFeatures::from_snapshot(&book(bids, asks)).unwrap();
        assert!((f.liquidity_concentration - 10.0 / 12.0).abs() < 1e-12);
    }
}
