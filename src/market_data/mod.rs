pub mod candles;
pub mod orderbook;
pub mod timeframe_cache;

// Re-export the core market-data types for convenient access
// (e.g. `use crate::market_data::Candle`).
pub use candles::{validate_frame, Candle, CandleBuffer, CandleKey};
pub use orderbook::{OrderBook, OrderBookManager, OrderbookSnapshot};
pub use timeframe_cache::{CachedBar, TimeframeCache};
