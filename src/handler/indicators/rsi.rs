use super::Indicator;

pub struct Rsi;

impl Indicator for Rsi {
    fn name(&self) -> &'static str {
        "rsi"
    }

    fn calculate(&self, prices: &[f64], period: usize) -> Vec<f64> {
        compute_rsi(prices, period)
    }
}

/// Relative strength index over every window of `period` day-over-day changes.
///
/// Each window averages gains and losses by `period` without smoothing. A
/// window with no losses saturates at 100, including a completely flat one.
/// Returns one value per window, `prices.len() - period` in total, or an empty
/// series when there are not more prices than `period`.
pub fn compute_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() <= period {
        return Vec::new();
    }

    (0..prices.len() - period)
        .map(|start| {
            let (gains, losses) = prices[start..=start + period].windows(2).fold(
                (0.0_f64, 0.0_f64),
                |(gains, losses), pair| {
                    let change = pair[1] - pair[0];
                    if change > 0.0 {
                        (gains + change, losses)
                    } else {
                        (gains, losses - change)
                    }
                },
            );

            let avg_gain = gains / period as f64;
            let avg_loss = losses / period as f64;

            // zero loss wins over zero gain
            if avg_loss == 0.0 {
                return 100.0;
            }

            let rs = avg_gain / avg_loss;
            100.0 - (100.0 / (1.0 + rs))
        })
        .collect()
}
