// =============================================================================
// Meridian Perp Engine — automated derivatives trading for Bybit V5 perps
// =============================================================================
//
// The crate is organised around the online trading pipeline:
//
//   market_data + indicators + features  -> canonical feature frames
//   regime + filters + strategy          -> the meta-layer signal path
//   sizing + exchange + execution        -> order flow and risk machinery
//   storage                              -> persistence, journal, recovery
//   bot                                  -> per-symbol loops + orchestrator
// =============================================================================

pub mod bot;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod execution;
pub mod features;
pub mod filters;
pub mod indicators;
pub mod market_data;
pub mod market_structure;
pub mod regime;
pub mod sizing;
pub mod storage;
pub mod strategy;
pub mod types;
