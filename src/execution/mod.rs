// Bar collection, position state and order sequencing
pub mod bar_window;
pub mod position_tracker;
pub mod sequencer;

pub use bar_window::{closed_bars, validate_bar_sequence, BarWindow};
pub use position_tracker::{
    validate_bracket, ExitReason, Position, PositionTracker, TrackerState,
};
pub use sequencer::{bracket_prices, CloseOutcome, OrderSequencer};
