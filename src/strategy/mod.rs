// Entry / exit decision rules
pub mod signals;

pub use signals::{detect_entry, detect_exit, EXIT_RSI_MARGIN};
