/// Incremental Relative Strength Index with Wilder smoothing
///
/// RSI measures the magnitude of recent price changes to evaluate
/// overbought or oversold conditions.
///
/// `avg_gain` / `avg_loss` are exponential averages with `alpha = 1 / period`
/// that start at zero on the first price (no change yet).
#[derive(Debug, Clone, PartialEq)]
pub struct Rsi {
    period: usize,
    alpha: f64,
    prev_close: Option<f64>,
    avg_gain: f64,
    avg_loss: f64,
    changes: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            alpha: 1.0 / period as f64,
            prev_close: None,
            avg_gain: 0.0,
            avg_loss: 0.0,
            changes: 0,
        }
    }

    /// Feed the next close and return the updated RSI
    ///
    /// Returns `None` for the very first close.
    pub fn update(&mut self, close: f64) -> Option<f64> {
        let prev = self.prev_close.replace(close)?;

        let change = close - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);

        self.avg_gain = self.alpha * gain + (1.0 - self.alpha) * self.avg_gain;
        self.avg_loss = self.alpha * loss + (1.0 - self.alpha) * self.avg_loss;
        self.changes += 1;

        Some(self.value())
    }

    /// Current RSI; 100 when there are no losses at all
    pub fn value(&self) -> f64 {
        rsi_from_averages(self.avg_gain, self.avg_loss)
    }

    /// True once `period` price changes have been smoothed in
    pub fn is_warm(&self) -> bool {
        self.changes >= self.period
    }

    pub fn avg_gain(&self) -> f64 {
        self.avg_gain
    }

    pub fn avg_loss(&self) -> f64 {
        self.avg_loss
    }
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// RSI at the last price, `None` until `period` changes are available
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    let mut rsi = Rsi::new(period);
    let mut last = None;
    for &price in prices {
        last = rsi.update(price);
    }

    if rsi.is_warm() {
        last
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_calculation() {
        let prices = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5,
            46.0, 46.5, 46.25, 46.0, 46.5,
        ];

        let rsi = calculate_rsi(&prices, 14);
        assert!(rsi.is_some());

        let rsi_value = rsi.unwrap();
        assert!(rsi_value > 0.0 && rsi_value < 100.0);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let prices = vec![100.0, 102.0, 101.0];
        let rsi = calculate_rsi(&prices, 14);
        assert!(rsi.is_none());
    }

    #[test]
    fn test_rsi_all_gains() {
        // Five straight gains: avg_loss stays exactly 0
        let prices = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        let mut rsi = Rsi::new(5);
        for price in &prices {
            if let Some(value) = rsi.update(*price) {
                assert_eq!(value, 100.0);
            }
        }
        assert_eq!(rsi.avg_loss(), 0.0);
        assert_eq!(calculate_rsi(&prices, 5), Some(100.0));
    }

    #[test]
    fn test_rsi_all_losses() {
        let prices = vec![105.0, 104.0, 103.0, 102.0, 101.0, 100.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(0.0));
    }

    #[test]
    fn test_rsi_flat_prices() {
        // No gains and no losses: defined as 100, never NaN
        let prices = vec![100.0; 10];
        let value = calculate_rsi(&prices, 5).unwrap();
        assert_eq!(value, 100.0);
    }

    #[test]
    fn test_rsi_known_values() {
        // alpha = 1/3, averages start at 0
        let mut rsi = Rsi::new(3);
        assert_eq!(rsi.update(100.0), None);
        rsi.update(103.0); // gain 3 -> avg_gain 1.0
        let value = rsi.update(100.0).unwrap(); // loss 3 -> avg_gain 2/3, avg_loss 1.0
        let expected = 100.0 - 100.0 / (1.0 + (2.0 / 3.0) / 1.0);
        assert!((value - expected).abs() < 1e-9);
        assert!((value - 40.0).abs() < 1e-9);
        assert!(!rsi.is_warm());
    }

    #[test]
    fn test_warm_up() {
        let mut rsi = Rsi::new(3);
        for (i, price) in [10.0, 11.0, 10.5, 11.5].iter().enumerate() {
            rsi.update(*price);
            assert_eq!(rsi.is_warm(), i >= 3);
        }
    }
}
