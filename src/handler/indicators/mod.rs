pub mod rsi;
pub mod sma;

pub use rsi::{compute_rsi, Rsi};
pub use sma::{compute_sma, Sma};

/// A sliding-window indicator over a price series.
///
/// Implementations are pure: the same prices and period always give the same
/// series, and malformed input yields an empty series instead of an error.
pub trait Indicator: Send + Sync {
    fn name(&self) -> &'static str;

    fn calculate(&self, prices: &[f64], period: usize) -> Vec<f64>;
}
