// Technical indicators module
// EMA, Wilder RSI and the per-bar engine that combines them

pub mod engine;
pub mod moving_average;
pub mod rsi;

pub use engine::{compute_series, IndicatorEngine, IndicatorSnapshot};
pub use moving_average::{calculate_ema_series, calculate_sma, Ema};
pub use rsi::{calculate_rsi, Rsi};
