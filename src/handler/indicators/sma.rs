use super::Indicator;

pub struct Sma;

impl Indicator for Sma {
    fn name(&self) -> &'static str {
        "sma"
    }

    fn calculate(&self, prices: &[f64], period: usize) -> Vec<f64> {
        compute_sma(prices, period)
    }
}

/// Simple moving average: the mean of every `period`-long window, advancing by one.
///
/// Returns an empty series when `period` is zero or longer than `prices`.
pub fn compute_sma(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || period > prices.len() {
        return Vec::new();
    }

    prices
        .windows(period)
        .map(|window| window.iter().sum::<f64>() / period as f64)
        .collect()
}
