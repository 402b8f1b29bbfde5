use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use crate::config::StrategyConfig;
use crate::error::ErrorKind;
use crate::exchange::Exchange;
use crate::trading::cycle::{BotState, TradingCycle};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    /// Too many consecutive permanent exchange rejections
    PermanentFailures(u32),
    /// Ran the requested number of cycles
    CycleLimit,
}

/// Set leverage / margin mode and pick up the instrument precision
///
/// Returns the config with the exchange's precision applied.
pub async fn prepare_account<E: Exchange + ?Sized>(
    exchange: &E,
    config: &StrategyConfig,
) -> Result<StrategyConfig> {
    exchange
        .configure_account(&config.symbol, config.leverage, config.margin_mode)
        .await?;
    let precision = exchange.get_instrument_precision(&config.symbol).await?;

    tracing::info!(
        "📐 {} precision: price {} decimals, amount {} decimals",
        config.symbol,
        precision.price_decimals,
        precision.amount_decimals
    );
    Ok(config.clone().with_precision(precision))
}

/// Drives trading cycles back to back with the configured sleep cadence
pub struct Runner<E: Exchange + ?Sized> {
    exchange: Arc<E>,
    config: StrategyConfig,
    max_cycles: Option<u64>,
}

impl<E: Exchange + ?Sized> Runner<E> {
    pub fn new(exchange: Arc<E>, config: StrategyConfig) -> Self {
        Self {
            exchange,
            config,
            max_cycles: None,
        }
    }

    /// Stop after `cycles` cycles without flattening
    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Run until `shutdown` resolves or the runner gives up
    ///
    /// `shutdown` is only observed between cycles, so an order sequence is
    /// never abandoned half-way. On interrupt exactly one flatten attempt is
    /// made.
    pub async fn run<F>(&self, state: &mut BotState, shutdown: F) -> Result<StopReason>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let cycle = TradingCycle::new(self.exchange.as_ref(), &self.config);
        let interval = self.config.timeframe_duration()?;
        let policy = &self.config.backoff;

        let mut consecutive_failures = 0u32;
        let mut permanent_failures = 0u32;

        tracing::info!(
            "🚀 Starting bot for {} on {} (lookback {}, EMA {}/{}, RSI {})",
            self.config.symbol,
            self.config.timeframe,
            self.config.lookback,
            self.config.ema_fast_period,
            self.config.ema_slow_period,
            self.config.rsi_period
        );

        loop {
            let started = Instant::now();

            let delay = match cycle.run_cycle(state).await {
                Ok(report) => {
                    consecutive_failures = 0;
                    permanent_failures = 0;
                    if let Some(position) = &report.entered {
                        tracing::info!(
                            "🎯 Entered {:?} @ {:.4}",
                            position.side,
                            position.entry_price
                        );
                    }
                    policy.sleep_after_cycle(interval, started.elapsed())
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let kind = e.kind();
                    if kind == ErrorKind::PermanentExchange {
                        permanent_failures += 1;
                    } else {
                        permanent_failures = 0;
                    }

                    if e.is_critical() {
                        tracing::error!("🚨 {}", e);
                    } else if policy
                        .escalate_after
                        .is_some_and(|n| consecutive_failures >= n)
                    {
                        tracing::error!(
                            "🔧 Cycle failing repeatedly ({} in a row): {}",
                            consecutive_failures,
                            e
                        );
                    } else {
                        tracing::warn!("🔧 Cycle error: {}", e);
                    }

                    if permanent_failures >= policy.max_permanent_failures {
                        tracing::error!(
                            "💥 {} consecutive permanent exchange errors, stopping",
                            permanent_failures
                        );
                        self.flatten_once(&cycle, state).await;
                        return Ok(StopReason::PermanentFailures(permanent_failures));
                    }

                    policy.delay_for(kind, interval)
                }
            };

            if self.max_cycles.is_some_and(|max| state.cycles >= max) {
                return Ok(StopReason::CycleLimit);
            }

            tracing::info!("⏳ Next analysis in {:.1}s", delay.as_secs_f64());
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("🛑 Bot stopped manually");
                    self.flatten_once(&cycle, state).await;
                    return Ok(StopReason::Interrupted);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn flatten_once(&self, cycle: &TradingCycle<'_, E>, state: &mut BotState) {
        if let Err(e) = cycle.shutdown(state).await {
            tracing::error!(
                "❌ Flatten failed, check the {} position manually: {}",
                self.config.symbol,
                e
            );
        }
    }
}
