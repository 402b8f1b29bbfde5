use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::moving_average::{calculate_sma, Ema};
use super::rsi::Rsi;
use crate::config::StrategyConfig;
use crate::models::{round_to, PriceBar};

/// Indicator values derived for one bar
///
/// Values are kept unrounded; use [`IndicatorSnapshot::rounded`] for
/// precision-tolerant comparisons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub volume: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    /// Mean volume over the configured window, including this bar
    pub rolling_volume_avg: Option<f64>,
    /// False during RSI warm-up; invalid snapshots must not feed signals
    pub valid: bool,
}

impl IndicatorSnapshot {
    /// Copy with both EMAs rounded to the instrument's price precision
    pub fn rounded(&self, price_decimals: u32) -> IndicatorSnapshot {
        IndicatorSnapshot {
            ema_fast: round_to(self.ema_fast, price_decimals),
            ema_slow: round_to(self.ema_slow, price_decimals),
            ..self.clone()
        }
    }
}

/// Computes fast/slow EMA, RSI and rolling volume bar by bar
///
/// Each update depends only on the engine's state and the new bar, so
/// feeding bars one at a time gives the same series as [`compute_series`].
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    ema_fast: Ema,
    ema_slow: Ema,
    rsi: Rsi,
    volume_window: usize,
    volumes: VecDeque<f64>,
    last_timestamp: Option<DateTime<Utc>>,
    previous: Option<IndicatorSnapshot>,
    latest: Option<IndicatorSnapshot>,
}

impl IndicatorEngine {
    pub fn new(config: &StrategyConfig) -> Self {
        Self::with_periods(
            config.ema_fast_period,
            config.ema_slow_period,
            config.rsi_period,
            config.volume_window,
        )
    }

    pub fn with_periods(
        ema_fast_period: usize,
        ema_slow_period: usize,
        rsi_period: usize,
        volume_window: usize,
    ) -> Self {
        Self {
            ema_fast: Ema::new(ema_fast_period),
            ema_slow: Ema::new(ema_slow_period),
            rsi: Rsi::new(rsi_period),
            volume_window,
            volumes: VecDeque::with_capacity(volume_window),
            last_timestamp: None,
            previous: None,
            latest: None,
        }
    }

    /// Incorporate the next bar and return its snapshot
    pub fn update(&mut self, bar: &PriceBar) -> IndicatorSnapshot {
        let ema_fast = self.ema_fast.update(bar.close);
        let ema_slow = self.ema_slow.update(bar.close);
        let rsi = self.rsi.update(bar.close).unwrap_or(self.rsi.value());

        self.volumes.push_back(bar.volume);
        while self.volumes.len() > self.volume_window {
            self.volumes.pop_front();
        }
        let rolling_volume_avg = calculate_sma(self.volumes.make_contiguous(), self.volume_window);

        let snapshot = IndicatorSnapshot {
            timestamp: bar.timestamp,
            close: bar.close,
            volume: bar.volume,
            ema_fast,
            ema_slow,
            rsi,
            rolling_volume_avg,
            valid: self.rsi.is_warm(),
        };

        self.last_timestamp = Some(bar.timestamp);
        self.previous = self.latest.replace(snapshot.clone());
        snapshot
    }

    /// Timestamp of the last bar incorporated
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    pub fn latest(&self) -> Option<&IndicatorSnapshot> {
        self.latest.as_ref()
    }

    /// Snapshot `bar` would produce, leaving the engine untouched
    ///
    /// Used for a still-forming bar whose close will change.
    pub fn preview(&self, bar: &PriceBar) -> IndicatorSnapshot {
        self.clone().update(bar)
    }

    /// The two most recent snapshots, oldest first
    pub fn last_two(&self) -> Option<(&IndicatorSnapshot, &IndicatorSnapshot)> {
        match (&self.previous, &self.latest) {
            (Some(prev), Some(last)) => Some((prev, last)),
            _ => None,
        }
    }
}

/// Full recomputation over a window: one snapshot per bar
pub fn compute_series(bars: &[PriceBar], config: &StrategyConfig) -> Vec<IndicatorSnapshot> {
    let mut engine = IndicatorEngine::new(config);
    bars.iter().map(|bar| engine.update(bar)).collect()
}
