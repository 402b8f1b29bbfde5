// Core modules
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod strategy;
pub mod trading;

// Re-export commonly used types
pub use config::StrategyConfig;
pub use error::{BotError, BracketFailure, ErrorKind};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
