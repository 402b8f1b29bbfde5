// Polling cycle and the loop that drives it
pub mod cycle;
pub mod runner;

pub use cycle::{BotState, CycleReport, TradingCycle};
pub use runner::{prepare_account, Runner, StopReason};
