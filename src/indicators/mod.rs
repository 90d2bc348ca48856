pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod rsi;
pub mod swing;
pub mod volume;

/// Series functions in this module all return vectors aligned with the input:
/// index i of the output corresponds to bar i, with `f64::NAN` during warmup.
/// Consumers must treat NaN as "indicator unavailable".
pub fn nan_vec(len: usize) -> Vec<f64> {
    vec![f64::NAN; len]
}
