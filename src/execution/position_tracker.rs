use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{BotError, BracketFailure};
use crate::models::{PositionSide, Side};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit rule fired on a closed bar
    Signal,
    /// Exchange no longer reports the position (stop or take-profit filled)
    BracketFilled,
    /// Interrupt received
    Shutdown,
    /// Bracket could not be repaired
    Escalation,
}

/// An open, fully protected position
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub stop_price: f64,
    pub take_profit_price: f64,
    pub opened_at: DateTime<Utc>,
    pub stop_order_id: String,
    pub take_profit_order_id: String,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        side: Side,
        entry_price: f64,
        size: f64,
        stop_price: f64,
        take_profit_price: f64,
        stop_order_id: String,
        take_profit_order_id: String,
    ) -> Result<Self> {
        validate_bracket(side, entry_price, stop_price, take_profit_price)?;
        if size <= 0.0 {
            return Err(BotError::InvalidState(format!(
                "position size must be positive, got {}",
                size
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            symbol,
            side,
            entry_price,
            size,
            stop_price,
            take_profit_price,
            opened_at: Utc::now(),
            stop_order_id,
            take_profit_order_id,
        })
    }

    /// Rebuild a position once every bracket leg of a failure exists
    pub fn from_repaired(failure: &BracketFailure) -> Result<Self> {
        match (&failure.stop_order_id, &failure.take_profit_order_id) {
            (Some(stop_id), Some(tp_id)) => Self::new(
                failure.symbol.clone(),
                failure.side,
                failure.entry_price,
                failure.size,
                failure.stop_price,
                failure.take_profit_price,
                stop_id.clone(),
                tp_id.clone(),
            ),
            _ => Err(BotError::InvalidState(format!(
                "bracket still missing {}",
                failure.missing_legs().join(" + ")
            ))),
        }
    }

    /// Unrealized P&L in quote currency at `price`
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => (price - self.entry_price) * self.size,
            Side::Short => (self.entry_price - price) * self.size,
        }
    }
}

/// Stop and take-profit must sit on opposite sides of the entry
///
/// Long: stop < entry < take-profit. Short: stop > entry > take-profit.
pub fn validate_bracket(
    side: Side,
    entry_price: f64,
    stop_price: f64,
    take_profit_price: f64,
) -> Result<()> {
    let ok = match side {
        Side::Long => stop_price < entry_price && entry_price < take_profit_price,
        Side::Short => stop_price > entry_price && entry_price > take_profit_price,
    };
    if ok {
        Ok(())
    } else {
        Err(BotError::InvalidState(format!(
            "{:?} bracket does not straddle entry {}: stop {} / take-profit {}",
            side, entry_price, stop_price, take_profit_price
        )))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerState {
    Flat,
    Protected(Position),
    /// Entry filled but at least one bracket leg is missing
    Unprotected(BracketFailure),
}

/// Owns the single position slot for the traded instrument
///
/// Opening requires Flat, so Long and Short never switch directly.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    state: TrackerState,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            state: TrackerState::Flat,
        }
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn side(&self) -> PositionSide {
        match &self.state {
            TrackerState::Flat => PositionSide::Flat,
            TrackerState::Protected(p) => p.side.into(),
            TrackerState::Unprotected(f) => f.side.into(),
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self.state, TrackerState::Flat)
    }

    /// New entries are only allowed from Flat
    pub fn can_enter(&self) -> bool {
        self.is_flat()
    }

    pub fn position(&self) -> Option<&Position> {
        match &self.state {
            TrackerState::Protected(p) => Some(p),
            _ => None,
        }
    }

    pub fn bracket_failure(&self) -> Option<&BracketFailure> {
        match &self.state {
            TrackerState::Unprotected(f) => Some(f),
            _ => None,
        }
    }

    /// Side and size of whatever the bot holds, protected or not
    pub fn exposure(&self) -> Option<(Side, f64)> {
        match &self.state {
            TrackerState::Flat => None,
            TrackerState::Protected(p) => Some((p.side, p.size)),
            TrackerState::Unprotected(f) => Some((f.side, f.size)),
        }
    }

    pub fn open(&mut self, position: Position) -> Result<()> {
        self.require_flat("open a position")?;
        tracing::info!(
            "✅ Opened {:?} {} @ {:.4} (size {}, SL {:.4}, TP {:.4})",
            position.side,
            position.symbol,
            position.entry_price,
            position.size,
            position.stop_price,
            position.take_profit_price
        );
        self.state = TrackerState::Protected(position);
        Ok(())
    }

    pub fn record_bracket_failure(&mut self, failure: BracketFailure) -> Result<()> {
        self.require_flat("record an unprotected entry")?;
        tracing::error!("🚨 {}", failure);
        self.state = TrackerState::Unprotected(failure);
        Ok(())
    }

    /// Replace the stored failure after a partial repair
    pub fn update_bracket_failure(&mut self, failure: BracketFailure) -> Result<()> {
        match self.state {
            TrackerState::Unprotected(_) => {
                self.state = TrackerState::Unprotected(failure);
                Ok(())
            }
            _ => Err(BotError::InvalidState(
                "no unprotected position to update".into(),
            )),
        }
    }

    /// Unprotected -> Protected once every leg is in place
    pub fn mark_repaired(&mut self, position: Position) -> Result<()> {
        match self.state {
            TrackerState::Unprotected(_) => {
                tracing::info!(
                    "🛡️ Bracket repaired for {:?} {}: SL {:.4} / TP {:.4}",
                    position.side,
                    position.symbol,
                    position.stop_price,
                    position.take_profit_price
                );
                self.state = TrackerState::Protected(position);
                Ok(())
            }
            _ => Err(BotError::InvalidState(
                "no unprotected position to repair".into(),
            )),
        }
    }

    /// Go Flat; returns what was held
    pub fn clear(&mut self, reason: ExitReason) -> Option<(Side, f64)> {
        let exposure = self.exposure();
        if let Some((side, size)) = exposure {
            tracing::info!(reason = ?reason, "Position {:?} size {} cleared", side, size);
        }
        self.state = TrackerState::Flat;
        exposure
    }

    fn require_flat(&self, action: &str) -> Result<()> {
        if self.is_flat() {
            Ok(())
        } else {
            Err(BotError::InvalidState(format!(
                "cannot {} while {:?}",
                action,
                self.side()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position() -> Position {
        Position::new(
            "ETHUSDT".to_string(),
            Side::Long,
            2000.0,
            0.5,
            1984.0,
            2030.0,
            "sl-1".to_string(),
            "tp-1".to_string(),
        )
        .unwrap()
    }

    fn failure(stop: Option<&str>, tp: Option<&str>) -> BracketFailure {
        BracketFailure {
            symbol: "ETHUSDT".to_string(),
            side: Side::Short,
            entry_price: 2000.0,
            size: 0.5,
            stop_price: 2016.0,
            take_profit_price: 1970.0,
            stop_order_id: stop.map(String::from),
            take_profit_order_id: tp.map(String::from),
            cause: "rejected".to_string(),
            repair_attempts: 0,
        }
    }

    #[test]
    fn test_bracket_must_straddle_entry() {
        assert!(validate_bracket(Side::Long, 100.0, 99.0, 101.0).is_ok());
        assert!(validate_bracket(Side::Long, 100.0, 101.0, 102.0).is_err());
        assert!(validate_bracket(Side::Short, 100.0, 101.0, 99.0).is_ok());
        assert!(validate_bracket(Side::Short, 100.0, 99.0, 98.0).is_err());
        // Rounded onto the entry price
        assert!(validate_bracket(Side::Long, 100.0, 100.0, 101.0).is_err());
    }

    #[test]
    fn test_open_and_clear() {
        let mut tracker = PositionTracker::new();
        assert_eq!(tracker.side(), PositionSide::Flat);
        assert!(tracker.can_enter());

        tracker.open(long_position()).unwrap();
        assert_eq!(tracker.side(), PositionSide::Long);
        assert!(!tracker.can_enter());
        assert_eq!(tracker.exposure(), Some((Side::Long, 0.5)));

        assert_eq!(tracker.clear(ExitReason::Signal), Some((Side::Long, 0.5)));
        assert!(tracker.is_flat());
        assert_eq!(tracker.clear(ExitReason::Signal), None);
    }

    #[test]
    fn test_no_direct_flip() {
        let mut tracker = PositionTracker::new();
        tracker.open(long_position()).unwrap();

        let short = Position::new(
            "ETHUSDT".to_string(),
            Side::Short,
            2000.0,
            0.5,
            2016.0,
            1970.0,
            "sl-2".to_string(),
            "tp-2".to_string(),
        )
        .unwrap();
        assert!(matches!(tracker.open(short), Err(BotError::InvalidState(_))));
        assert_eq!(tracker.side(), PositionSide::Long);
    }

    #[test]
    fn test_unprotected_blocks_entries() {
        let mut tracker = PositionTracker::new();
        tracker
            .record_bracket_failure(failure(Some("sl-1"), None))
            .unwrap();

        assert_eq!(tracker.side(), PositionSide::Short);
        assert!(!tracker.can_enter());
        assert!(tracker.position().is_none());
        assert_eq!(
            tracker.bracket_failure().unwrap().missing_legs(),
            vec!["take-profit"]
        );
        assert!(tracker.open(long_position()).is_err());
    }

    #[test]
    fn test_repair_requires_both_legs() {
        assert!(Position::from_repaired(&failure(Some("sl-1"), None)).is_err());

        let mut tracker = PositionTracker::new();
        tracker
            .record_bracket_failure(failure(Some("sl-1"), None))
            .unwrap();

        let position = Position::from_repaired(&failure(Some("sl-1"), Some("tp-9"))).unwrap();
        tracker.mark_repaired(position).unwrap();

        let position = tracker.position().unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.take_profit_order_id, "tp-9");
    }

    #[test]
    fn test_mark_repaired_when_flat_fails() {
        let mut tracker = PositionTracker::new();
        assert!(tracker.mark_repaired(long_position()).is_err());
    }

    #[test]
    fn test_unrealized_pnl() {
        let position = long_position();
        assert_eq!(position.unrealized_pnl(2010.0), 5.0);
    }
}
