use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BotError, ErrorKind};
use crate::models::InstrumentPrecision;
use crate::Result;

const ENV_PREFIX: &str = "SCALPBOT";

/// Strategy parameters, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub symbol: String,
    pub timeframe: String,
    /// Base asset quantity per trade before leverage
    pub amount: f64,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub ema_fast_period: usize,
    pub ema_slow_period: usize,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub price_decimals: u32,
    pub amount_decimals: u32,
    /// Bars kept in the sliding window
    pub lookback: usize,
    pub volume_filter: bool,
    pub volume_window: usize,
    /// Drop the still-forming bar the exchange returns last
    pub closed_bars_only: bool,
    /// Compare the tracked position with the exchange's report every cycle
    pub reconcile: bool,
    pub testnet: bool,
    /// Repair attempts for a missing bracket leg before flattening
    pub max_bracket_repairs: u32,
    pub backoff: BackoffPolicy,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbol: "ETHUSDT".to_string(),
            timeframe: "5m".to_string(),
            amount: 0.05,
            leverage: 10,
            margin_mode: MarginMode::Cross,
            stop_loss_pct: 0.008,  // 0.8%
            take_profit_pct: 0.015, // 1.5%
            ema_fast_period: 8,
            ema_slow_period: 20,
            rsi_period: 12,
            rsi_overbought: 68.0,
            rsi_oversold: 32.0,
            price_decimals: 2,
            amount_decimals: 3,
            lookback: 100,
            volume_filter: false,
            volume_window: 5,
            closed_bars_only: true,
            reconcile: true,
            testnet: true,
            max_bracket_repairs: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    pub fn as_binance(self) -> &'static str {
        match self {
            MarginMode::Cross => "CROSSED",
            MarginMode::Isolated => "ISOLATED",
        }
    }
}

impl StrategyConfig {
    /// Load from an optional TOML file, then `SCALPBOT_*` environment overrides
    ///
    /// Nested keys use a double underscore: `SCALPBOT_BACKOFF__NETWORK_DELAY_SECS=30`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: StrategyConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(BotError::Config("symbol must not be empty".into()));
        }
        self.timeframe_duration()?;
        if self.amount <= 0.0 {
            return Err(BotError::Config("amount must be positive".into()));
        }
        if self.leverage == 0 || self.leverage > 125 {
            return Err(BotError::Config(format!(
                "leverage {} outside 1..=125",
                self.leverage
            )));
        }
        if !(self.stop_loss_pct > 0.0 && self.stop_loss_pct < 1.0) {
            return Err(BotError::Config("stop_loss_pct must be in (0, 1)".into()));
        }
        if !(self.take_profit_pct > 0.0 && self.take_profit_pct < 1.0) {
            return Err(BotError::Config(
                "take_profit_pct must be in (0, 1)".into(),
            ));
        }
        if self.ema_fast_period == 0 || self.ema_fast_period >= self.ema_slow_period {
            return Err(BotError::Config(format!(
                "ema_fast_period ({}) must be positive and below ema_slow_period ({})",
                self.ema_fast_period, self.ema_slow_period
            )));
        }
        if self.rsi_period == 0 {
            return Err(BotError::Config("rsi_period must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.rsi_oversold)
            || !(0.0..=100.0).contains(&self.rsi_overbought)
            || self.rsi_oversold >= self.rsi_overbought
        {
            return Err(BotError::Config(format!(
                "rsi_oversold ({}) must be below rsi_overbought ({}) within [0, 100]",
                self.rsi_oversold, self.rsi_overbought
            )));
        }
        if self.volume_window == 0 {
            return Err(BotError::Config("volume_window must be positive".into()));
        }
        if self.lookback < self.min_bars_required() {
            return Err(BotError::Config(format!(
                "lookback {} too short, need at least {} bars",
                self.lookback,
                self.min_bars_required()
            )));
        }
        Ok(())
    }

    /// Bars needed before two consecutive valid snapshots exist
    pub fn min_bars_required(&self) -> usize {
        self.rsi_period + 2
    }

    pub fn timeframe_duration(&self) -> Result<Duration> {
        parse_timeframe(&self.timeframe)
    }

    /// Adopt the precision the exchange declares for the symbol
    pub fn with_precision(mut self, precision: InstrumentPrecision) -> Self {
        self.price_decimals = precision.price_decimals;
        self.amount_decimals = precision.amount_decimals;
        self
    }
}

/// Parse an exchange interval string (`1m`, `5m`, `1h`, `1d`, ...)
pub fn parse_timeframe(timeframe: &str) -> Result<Duration> {
    let invalid = || BotError::Config(format!("unsupported timeframe '{}'", timeframe));
    if timeframe.len() < 2 {
        return Err(invalid());
    }
    let (count, unit) = timeframe.split_at(timeframe.len() - 1);
    let count: u64 = count.parse().map_err(|_| invalid())?;
    if count == 0 {
        return Err(invalid());
    }
    let unit_secs = match unit {
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(count * unit_secs))
}

/// Delay policy applied by the runner between cycles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Never sleep less than this between cycles
    pub min_sleep_secs: u64,
    pub network_delay_secs: u64,
    pub exchange_delay_secs: u64,
    /// Delay after a data error; `None` waits for the next bar
    pub data_delay_secs: Option<u64>,
    /// Consecutive permanent exchange errors before the runner stops
    pub max_permanent_failures: u32,
    /// Consecutive transient failures before logging escalates to error; `None` never escalates
    pub escalate_after: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_sleep_secs: 10,
            network_delay_secs: 60,
            exchange_delay_secs: 120,
            data_delay_secs: None,
            max_permanent_failures: 3,
            escalate_after: Some(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next cycle after a failure of the given kind
    pub fn delay_for(&self, kind: ErrorKind, cycle_interval: Duration) -> Duration {
        let secs = match kind {
            ErrorKind::Network => self.network_delay_secs,
            ErrorKind::Exchange | ErrorKind::PermanentExchange => self.exchange_delay_secs,
            ErrorKind::Data => match self.data_delay_secs {
                Some(secs) => secs,
                None => return cycle_interval.max(self.min_sleep()),
            },
            // Bracket repair and state errors retry on the normal cadence
            ErrorKind::BracketFailure | ErrorKind::InvalidState | ErrorKind::Config => {
                self.min_sleep_secs
            }
        };
        Duration::from_secs(secs).max(self.min_sleep())
    }

    /// Sleep after a completed cycle: what is left of the interval, floored
    pub fn sleep_after_cycle(&self, cycle_interval: Duration, elapsed: Duration) -> Duration {
        cycle_interval
            .saturating_sub(elapsed)
            .max(self.min_sleep())
    }

    pub fn min_sleep(&self) -> Duration {
        Duration::from_secs(self.min_sleep_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StrategyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeframe_duration().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_timeframe() {
        assert_eq!(parse_timeframe("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_timeframe("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_timeframe("4h").unwrap(), Duration::from_secs(14_400));
        assert!(parse_timeframe("5x").is_err());
        assert!(parse_timeframe("m").is_err());
        assert!(parse_timeframe("0m").is_err());
    }

    #[test]
    fn test_rejects_inverted_emas() {
        let config = StrategyConfig {
            ema_fast_period: 20,
            ema_slow_period: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BotError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_rsi_levels() {
        let config = StrategyConfig {
            rsi_overbought: 30.0,
            rsi_oversold: 70.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_short_lookback() {
        let config = StrategyConfig {
            lookback: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sleep_after_cycle_has_floor() {
        let policy = BackoffPolicy::default();
        let interval = Duration::from_secs(300);

        assert_eq!(
            policy.sleep_after_cycle(interval, Duration::from_secs(20)),
            Duration::from_secs(280)
        );
        // Cycle overran the interval: still sleep the minimum
        assert_eq!(
            policy.sleep_after_cycle(interval, Duration::from_secs(400)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_delay_by_error_kind() {
        let policy = BackoffPolicy::default();
        let interval = Duration::from_secs(300);

        assert_eq!(
            policy.delay_for(ErrorKind::Network, interval),
            Duration::from_secs(60)
        );
        assert_eq!(
            policy.delay_for(ErrorKind::Exchange, interval),
            Duration::from_secs(120)
        );
        assert_eq!(policy.delay_for(ErrorKind::Data, interval), interval);
    }

    #[test]
    fn test_with_precision() {
        let config = StrategyConfig::default().with_precision(InstrumentPrecision {
            price_decimals: 1,
            amount_decimals: 2,
        });
        assert_eq!(config.price_decimals, 1);
        assert_eq!(config.amount_decimals, 2);
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!(
            "scalpbot-config-{}.toml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(
            &path,
            "symbol = \"BTCUSDT\"\nema_fast_period = 9\nema_slow_period = 21\n\n[backoff]\nnetwork_delay_secs = 30\n",
        )
        .unwrap();

        let config = StrategyConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.symbol, "BTCUSDT");
        assert_eq!(config.ema_fast_period, 9);
        assert_eq!(config.ema_slow_period, 21);
        assert_eq!(config.backoff.network_delay_secs, 30);
        // Untouched keys keep their defaults
        assert_eq!(config.rsi_period, 12);
        assert_eq!(config.backoff.exchange_delay_secs, 120);
    }
}
