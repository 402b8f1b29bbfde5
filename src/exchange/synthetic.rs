use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::PriceBar;

/// Market scenario types for synthetic bars
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Drift that flips direction every few dozen bars (produces EMA crosses)
    Swings,
    /// Mean-reverting chop around the base price
    Sideways,
    /// Large random moves (±3% per bar)
    Volatile,
}

impl FromStr for MarketScenario {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "swings" => Ok(MarketScenario::Swings),
            "sideways" => Ok(MarketScenario::Sideways),
            "volatile" => Ok(MarketScenario::Volatile),
            other => Err(format!(
                "unknown scenario '{}' (expected swings, sideways or volatile)",
                other
            )),
        }
    }
}

/// Seeded random-walk bar generator
///
/// Feeds [`super::PaperExchange`] in paper mode and indicator property tests.
#[derive(Debug)]
pub struct SyntheticMarket {
    rng: StdRng,
    scenario: MarketScenario,
    base_price: f64,
    base_volume: f64,
    price: f64,
    drift: f64,
    bars_in_regime: usize,
}

impl SyntheticMarket {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64, base_price: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            scenario: MarketScenario::Swings,
            base_price,
            base_volume: 1_000.0,
            price: base_price,
            drift: 0.001,
            bars_in_regime: 0,
        }
    }

    pub fn with_scenario(mut self, scenario: MarketScenario) -> Self {
        self.scenario = scenario;
        self
    }

    /// Generate `num_bars` consecutive bars ending at the current interval boundary
    pub fn generate(&mut self, num_bars: usize, interval_minutes: i64) -> Vec<PriceBar> {
        let step = Duration::minutes(interval_minutes);
        let now = Utc::now();
        let aligned = now.duration_trunc(step).unwrap_or(now);
        let start = aligned - step * num_bars as i32;

        (0..num_bars)
            .map(|i| self.next_bar(start + step * i as i32))
            .collect()
    }

    /// Produce the next bar opening at `timestamp`
    pub fn next_bar(&mut self, timestamp: DateTime<Utc>) -> PriceBar {
        let open = self.price;
        let change = match self.scenario {
            MarketScenario::Swings => {
                self.bars_in_regime += 1;
                if self.bars_in_regime >= self.rng.gen_range(20..60) {
                    self.drift = -self.drift;
                    self.bars_in_regime = 0;
                }
                self.price * (self.drift + self.rng.gen_range(-0.002..0.002))
            }
            MarketScenario::Sideways => {
                let reversion = (self.base_price - self.price) * 0.1; // 10% pull to mean
                reversion + self.price * self.rng.gen_range(-0.005..0.005)
            }
            MarketScenario::Volatile => self.price * self.rng.gen_range(-0.03..0.03),
        };

        // Prevent price from going too low
        self.price = (self.price + change).max(self.base_price * 0.1);
        let close = self.price;

        // ±0.2% intrabar movement beyond open/close
        let noise_pct = 0.002;
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..noise_pct));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..noise_pct));

        // Vary volume ±30%
        let volume = self.base_volume * self.rng.gen_range(0.7..1.3);

        PriceBar {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}
