use crate::StrategyError;

/// RSI (Relative Strength Index) with Wilder smoothing.
///
/// Returns `None` until at least `period + 1` closes are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rsi {
    period: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Result<Self, StrategyError> {
        if period < 2 {
            return Err(StrategyError::InvalidConfig(format!(
                "RSI period must be >= 2, got {period}"
            )));
        }
        Ok(Self { period })
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Compute RSI from close prices, oldest first.
    pub fn compute(&self, closes: &[f64]) -> Option<f64> {
        if closes.len() <= self.period {
            return None;
        }

        let n = self.period as f64;
        let mut changes = closes.windows(2).map(|w| w[1] - w[0]);

        // Seed with simple averages over the first `period` changes.
        let (gain_sum, loss_sum) = changes
            .by_ref()
            .take(self.period)
            .fold((0.0, 0.0), |(g, l), c| (g + c.max(0.0), l + (-c).max(0.0)));
        let (avg_gain, avg_loss) = changes.fold((gain_sum / n, loss_sum / n), |(g, l), c| {
            (
                (g * (n - 1.0) + c.max(0.0)) / n,
                (l * (n - 1.0) + (-c).max(0.0)) / n,
            )
        });

        if avg_loss == 0.0 {
            return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
        }
        let rs = avg_gain / avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}
