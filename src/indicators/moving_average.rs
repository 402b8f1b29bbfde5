/// Simple Moving Average of the last `period` values
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Incremental Exponential Moving Average
///
/// `ema[t] = close[t] * k + ema[t-1] * (1 - k)` with `k = 2 / (period + 1)`,
/// seeded with the first value (no SMA warm-up).
#[derive(Debug, Clone, PartialEq)]
pub struct Ema {
    multiplier: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            multiplier: 2.0 / (period as f64 + 1.0),
            value: None,
        }
    }

    /// Feed the next value and return the updated average
    pub fn update(&mut self, price: f64) -> f64 {
        let next = match self.value {
            Some(prev) => price * self.multiplier + prev * (1.0 - self.multiplier),
            None => price,
        };
        self.value = Some(next);
        next
    }
}

/// EMA of every prefix of `prices`, one value per input
pub fn calculate_ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    let mut ema = Ema::new(period);
    prices.iter().map(|&p| ema.update(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        let sma = calculate_sma(&prices, 5);
        assert_eq!(sma, Some(104.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        let sma = calculate_sma(&prices, 5);
        assert!(sma.is_none());
    }

    #[test]
    fn test_ema_seeded_with_first_value() {
        let series = calculate_ema_series(&[100.0, 102.0, 104.0], 3);
        // k = 0.5
        assert_eq!(series, vec![100.0, 101.0, 102.5]);
    }

    #[test]
    fn test_ema_constant_series() {
        let prices = vec![42.0; 50];
        for value in calculate_ema_series(&prices, 8) {
            assert_eq!(value, 42.0);
        }
    }

    #[test]
    fn test_ema_rising_series_stays_within_bounds() {
        let prices: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let series = calculate_ema_series(&prices, 8);

        for (i, value) in series.iter().enumerate() {
            assert!(*value >= prices[0] && *value <= prices[i]);
        }
        // Lag toward the latest value is bounded once warmed up
        let last = *series.last().unwrap();
        let gap = prices.last().unwrap() - last;
        assert!(gap > 0.0 && gap < 4.0);
    }

    #[test]
    fn test_ema_empty() {
        assert!(calculate_ema_series(&[], 5).is_empty());
    }
}
