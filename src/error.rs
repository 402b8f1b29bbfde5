use thiserror::Error;

use crate::models::{PositionSide, Side};

/// Error taxonomy for the trading loop
///
/// Callers branch on [`ErrorKind`] rather than on message text:
/// - `Network`: transient, retry after the network backoff
/// - `Exchange`: request rejected; `permanent` ones must not be retried forever
/// - `Data`: bad or insufficient market data, skip the cycle
/// - `BracketFailure`: entry filled but protection is missing (critical)
#[derive(Debug, Error)]
pub enum BotError {
    #[error("network error: {0}")]
    Network(String),

    #[error("exchange rejected request (code {code}): {message}")]
    Exchange {
        code: i64,
        message: String,
        permanent: bool,
    },

    #[error("data error: {0}")]
    Data(String),

    #[error("{0}")]
    BracketFailure(Box<BracketFailure>),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Exchange,
    PermanentExchange,
    Data,
    BracketFailure,
    Config,
    InvalidState,
}

impl BotError {
    pub fn exchange(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        let permanent = is_permanent_exchange_code(code);
        BotError::Exchange {
            code,
            message,
            permanent,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BotError::Network(_) => ErrorKind::Network,
            BotError::Exchange {
                permanent: true, ..
            } => ErrorKind::PermanentExchange,
            BotError::Exchange { .. } => ErrorKind::Exchange,
            BotError::Data(_) => ErrorKind::Data,
            BotError::BracketFailure(_) => ErrorKind::BracketFailure,
            BotError::Config(_) => ErrorKind::Config,
            BotError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Whether the same request can succeed later without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Exchange | ErrorKind::Data
        )
    }

    pub fn is_critical(&self) -> bool {
        matches!(self.kind(), ErrorKind::BracketFailure)
    }
}

/// Binance futures error codes that will keep failing with the same request
///
/// -1111 precision, -1013/-4003/-4164 quantity and notional filters,
/// -2014/-2015 bad credentials, -1121 unknown symbol, -1102/-1106 bad parameters
fn is_permanent_exchange_code(code: i64) -> bool {
    matches!(
        code,
        -1111 | -1013 | -1121 | -2014 | -2015 | -4003 | -4164 | -1102 | -1106
    )
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BotError::exchange(0, format!("malformed response: {}", e))
        } else {
            BotError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(e: serde_json::Error) -> Self {
        BotError::exchange(0, format!("malformed response: {}", e))
    }
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        BotError::Config(e.to_string())
    }
}

/// Entry filled but at least one protective order is missing
///
/// Holds everything an operator needs to reconstruct the account state.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketFailure {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub stop_price: f64,
    pub take_profit_price: f64,
    pub stop_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub cause: String,
    pub repair_attempts: u32,
}

impl BracketFailure {
    pub fn missing_legs(&self) -> Vec<&'static str> {
        let mut legs = Vec::new();
        if self.stop_order_id.is_none() {
            legs.push("stop-loss");
        }
        if self.take_profit_order_id.is_none() {
            legs.push("take-profit");
        }
        legs
    }

    pub fn position_side(&self) -> PositionSide {
        self.side.into()
    }
}

impl std::fmt::Display for BracketFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UNPROTECTED {:?} position on {}: size {} @ {} missing {} (sl {} / tp {}): {}",
            self.side,
            self.symbol,
            self.size,
            self.entry_price,
            self.missing_legs().join(" + "),
            self.stop_price,
            self.take_profit_price,
            self.cause
        )
    }
}

impl From<BracketFailure> for BotError {
    fn from(failure: BracketFailure) -> Self {
        BotError::BracketFailure(Box::new(failure))
    }
}
