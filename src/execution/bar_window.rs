use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::error::BotError;
use crate::models::PriceBar;
use crate::Result;

/// Fixed-capacity sliding window of price bars
///
/// Timestamps are strictly increasing; the oldest bar is evicted once the
/// window is full.
#[derive(Debug, Clone)]
pub struct BarWindow {
    bars: VecDeque<PriceBar>,
    capacity: usize,
}

impl BarWindow {
    /// Create a new window
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of bars to keep (the configured lookback)
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a bar, rejecting anything not newer than the last one
    pub fn push(&mut self, bar: PriceBar) -> Result<()> {
        if let Some(last) = self.last_timestamp() {
            if bar.timestamp <= last {
                return Err(BotError::Data(format!(
                    "bar at {} is not after last bar at {}",
                    bar.timestamp, last
                )));
            }
        }

        self.bars.push_back(bar);
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
        Ok(())
    }

    /// Append the bars newer than the window's last bar
    ///
    /// Bars already in the window (the overlap of a fresh fetch) are skipped.
    /// Returns the newly appended bars, oldest first.
    pub fn merge(&mut self, bars: &[PriceBar]) -> Result<Vec<PriceBar>> {
        let last = self.last_timestamp();
        let mut appended = Vec::new();

        for bar in bars {
            if last.is_some_and(|t| bar.timestamp <= t) {
                continue;
            }
            self.push(bar.clone())?;
            appended.push(bar.clone());
        }
        Ok(appended)
    }

    /// Replace the whole window
    pub fn reset(&mut self, bars: &[PriceBar]) -> Result<()> {
        self.clear();
        for bar in bars {
            self.push(bar.clone())?;
        }
        Ok(())
    }

    pub fn bars(&self) -> Vec<PriceBar> {
        self.bars.iter().cloned().collect()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.back().map(|b| b.timestamp)
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn clear(&mut self) {
        self.bars.clear();
    }
}

/// Check that bars are sorted and evenly spaced
///
/// Allows up to 1.5x the expected interval between consecutive bars.
pub fn validate_bar_sequence(bars: &[PriceBar], interval: Duration) -> Result<()> {
    let max_gap = interval + interval / 2;

    for pair in bars.windows(2) {
        let diff = pair[1].timestamp - pair[0].timestamp;

        if diff <= Duration::zero() {
            return Err(BotError::Data(format!(
                "bars are not sorted by timestamp ({} then {})",
                pair[0].timestamp, pair[1].timestamp
            )));
        }

        if diff > max_gap {
            return Err(BotError::Data(format!(
                "data gap detected: {}s between bars (expected ~{}s) from {} to {}",
                diff.num_seconds(),
                interval.num_seconds(),
                pair[0].timestamp.format("%H:%M:%S"),
                pair[1].timestamp.format("%H:%M:%S")
            )));
        }
    }

    Ok(())
}

/// Drop the trailing bar if it has not closed yet at `now`
pub fn closed_bars(bars: Vec<PriceBar>, interval: Duration, now: DateTime<Utc>) -> Vec<PriceBar> {
    let mut bars = bars;
    while bars.last().is_some_and(|b| b.timestamp + interval > now) {
        bars.pop();
    }
    bars
}
