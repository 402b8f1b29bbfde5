use chrono::{DateTime, Utc};

use crate::config::StrategyConfig;
use crate::error::{BotError, BracketFailure};
use crate::exchange::Exchange;
use crate::execution::{
    closed_bars, validate_bar_sequence, validate_bracket, BarWindow, CloseOutcome, ExitReason,
    OrderSequencer, Position, PositionTracker,
};
use crate::indicators::IndicatorEngine;
use crate::models::{ExchangePosition, PriceBar, Side, Signal};
use crate::strategy::{detect_entry, detect_exit};
use crate::Result;

/// Everything the bot knows between cycles
#[derive(Debug, Clone)]
pub struct BotState {
    pub window: BarWindow,
    pub engine: IndicatorEngine,
    pub tracker: PositionTracker,
    /// A close went through but its bracket orders may still be resting
    pub pending_cancel: bool,
    /// Position the exchange reports that the bot did not open
    pub untracked_exposure: Option<ExchangePosition>,
    pub cycles: u64,
}

impl BotState {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            window: BarWindow::new(config.lookback),
            engine: IndicatorEngine::new(config),
            tracker: PositionTracker::new(),
            pending_cancel: false,
            untracked_exposure: None,
            cycles: 0,
        }
    }
}

/// What a completed cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub new_bars: usize,
    /// `None` when no new valid bar was evaluated
    pub signal: Option<Signal>,
    /// Reconciliation found the tracked position gone
    pub bracket_filled: bool,
    pub repaired: bool,
    /// Unrepairable bracket was closed
    pub escalated: bool,
    pub exited: Option<Side>,
    pub entered: Option<Position>,
}

/// One polling cycle: reconcile, repair, fetch, compute, exit, enter
pub struct TradingCycle<'a, E: Exchange + ?Sized> {
    exchange: &'a E,
    config: &'a StrategyConfig,
}

impl<'a, E: Exchange + ?Sized> TradingCycle<'a, E> {
    pub fn new(exchange: &'a E, config: &'a StrategyConfig) -> Self {
        Self { exchange, config }
    }

    fn sequencer(&self) -> OrderSequencer<'a, E> {
        OrderSequencer::new(self.exchange, self.config)
    }

    pub async fn run_cycle(&self, state: &mut BotState) -> Result<CycleReport> {
        self.run_cycle_at(state, Utc::now()).await
    }

    async fn run_cycle_at(&self, state: &mut BotState, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        state.cycles += 1;
        let symbol = self.config.symbol.as_str();

        if state.pending_cancel {
            self.exchange.cancel_all_orders(symbol).await?;
            tracing::info!(symbol, "Cancelled leftover bracket orders");
            state.pending_cancel = false;
        }

        if self.config.reconcile {
            self.reconcile(state, &mut report).await?;
        }

        if let Some(failure) = state.tracker.bracket_failure().cloned() {
            self.resolve_bracket_failure(state, failure, &mut report)
                .await?;
        }

        let (new_bars, forming) = self.refresh_indicators(state, now).await?;
        report.new_bars = new_bars;

        let evaluated = match &forming {
            // Forming bar is only ever previewed, never committed
            Some(bar) => state
                .engine
                .latest()
                .map(|prev| (prev.clone(), state.engine.preview(bar))),
            None if new_bars > 0 => state
                .engine
                .last_two()
                .map(|(p, l)| (p.clone(), l.clone())),
            None => None,
        };
        let Some((prev, last)) = evaluated else {
            tracing::debug!(symbol, "No new bar to evaluate");
            return Ok(report);
        };

        if !last.valid {
            tracing::info!(
                "⏳ Warming up indicators ({} bars, RSI needs {} changes)",
                state.window.len(),
                self.config.rsi_period
            );
            return Ok(report);
        }

        let prec = self.config.price_decimals as usize;
        tracing::info!(
            "📊 {} close {:.prec$} | EMA{} {:.prec$} / EMA{} {:.prec$} | RSI {:.1}",
            symbol,
            last.close,
            self.config.ema_fast_period,
            last.ema_fast,
            self.config.ema_slow_period,
            last.ema_slow,
            last.rsi,
            prec = prec
        );
        if let Some(position) = state.tracker.position() {
            tracing::info!(
                "📍 Holding {:?} @ {:.prec$}, unrealized P&L {:.2}",
                position.side,
                position.entry_price,
                position.unrealized_pnl(last.close),
                prec = prec
            );
        }

        // Exit first so an opposite cross can re-enter on the same bar
        if let Some(position) = state.tracker.position() {
            let (side, size) = (position.side, position.size);
            if detect_exit(side.into(), &last, self.config) {
                tracing::info!("⚠️ Exit signal for {:?} {}", side, symbol);
                let outcome = self.sequencer().close(side, size).await?;
                self.finish_close(state, ExitReason::Signal, &outcome);
                report.exited = Some(side);
            }
        }

        let signal = detect_entry(&prev, &last, self.config);
        report.signal = Some(signal);
        if signal == Signal::Hold {
            return Ok(report);
        }

        if let Some(reason) = entry_blocker(state) {
            tracing::warn!(symbol, signal = ?signal, "Entry skipped: {}", reason);
            return Ok(report);
        }

        match self.sequencer().enter(signal).await {
            Ok(position) => {
                state.tracker.open(position.clone())?;
                report.entered = Some(position);
                Ok(report)
            }
            Err(BotError::BracketFailure(failure)) => {
                state.tracker.record_bracket_failure((*failure).clone())?;
                if !repairable(&failure) {
                    tracing::error!("🚨 Bracket prices are invalid, flattening: {}", failure);
                    self.escalate(state, &mut report).await?;
                }
                Err(BotError::BracketFailure(failure))
            }
            Err(e) => Err(e),
        }
    }

    /// Single flatten attempt of whatever the bot holds
    pub async fn shutdown(&self, state: &mut BotState) -> Result<Option<CloseOutcome>> {
        if let Some(exposure) = &state.untracked_exposure {
            tracing::warn!(
                "Leaving untracked {:?} position of {} untouched",
                exposure.side,
                exposure.size
            );
        }

        let outcome = self
            .sequencer()
            .flatten(&mut state.tracker, ExitReason::Shutdown)
            .await?;
        match &outcome {
            Some(o) if !o.orders_cancelled => state.pending_cancel = true,
            Some(_) => {}
            None => tracing::info!("No open position to flatten"),
        }
        Ok(outcome)
    }

    /// Compare the tracked position with what the exchange reports
    async fn reconcile(&self, state: &mut BotState, report: &mut CycleReport) -> Result<()> {
        let symbol = self.config.symbol.as_str();
        let reported = self.exchange.fetch_position(symbol).await?;

        state.untracked_exposure = None;
        match (state.tracker.exposure(), reported) {
            (Some((side, _)), None) => {
                tracing::info!(
                    "🎯 {:?} {} closed on the exchange (stop-loss or take-profit filled)",
                    side,
                    symbol
                );
                state.tracker.clear(ExitReason::BracketFilled);
                report.bracket_filled = true;
                // The sibling bracket order is still resting
                if let Err(e) = self.exchange.cancel_all_orders(symbol).await {
                    tracing::warn!(symbol, "Could not cancel leftover orders: {}", e);
                    state.pending_cancel = true;
                }
            }
            (None, Some(position)) => {
                tracing::warn!(
                    "Exchange reports an untracked {:?} position of {} @ {}; entries blocked",
                    position.side,
                    position.size,
                    position.entry_price
                );
                state.untracked_exposure = Some(position);
            }
            (Some((side, size)), Some(position)) => {
                if position.side != side || (position.size - size).abs() > 1e-9 {
                    tracing::warn!(
                        "Tracked {:?} {} differs from exchange {:?} {}",
                        side,
                        size,
                        position.side,
                        position.size
                    );
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Repair the missing legs, or flatten once the repair budget is spent
    async fn resolve_bracket_failure(
        &self,
        state: &mut BotState,
        mut failure: BracketFailure,
        report: &mut CycleReport,
    ) -> Result<()> {
        if !repairable(&failure) {
            tracing::error!("🚨 Bracket prices are invalid, flattening: {}", failure);
            return self.escalate(state, report).await;
        }
        if failure.repair_attempts >= self.config.max_bracket_repairs {
            tracing::error!(
                "🚨 Bracket still missing {} after {} repairs, flattening",
                failure.missing_legs().join(" + "),
                failure.repair_attempts
            );
            return self.escalate(state, report).await;
        }

        match self.sequencer().repair(&mut failure).await {
            Ok(position) => {
                state.tracker.mark_repaired(position)?;
                report.repaired = true;
                Ok(())
            }
            Err(e) => {
                state.tracker.update_bracket_failure(failure)?;
                Err(e)
            }
        }
    }

    /// Close out the unprotected position
    async fn escalate(&self, state: &mut BotState, report: &mut CycleReport) -> Result<()> {
        let outcome = self
            .sequencer()
            .flatten(&mut state.tracker, ExitReason::Escalation)
            .await?;
        if outcome.is_some_and(|o| !o.orders_cancelled) {
            state.pending_cancel = true;
        }
        report.escalated = true;
        Ok(())
    }

    /// Fetch bars and feed the newly closed ones to the engine
    ///
    /// Returns how many closed bars were added, plus the still-forming bar
    /// when forming bars are evaluated. The forming bar never enters the
    /// window or the engine, so its final values are picked up once it closes.
    async fn refresh_indicators(
        &self,
        state: &mut BotState,
        now: DateTime<Utc>,
    ) -> Result<(usize, Option<PriceBar>)> {
        let interval = chrono::Duration::from_std(self.config.timeframe_duration()?)
            .map_err(|e| BotError::Config(format!("timeframe out of range: {}", e)))?;

        // One extra bar to make up for the forming one
        let limit = self.config.lookback + 1;
        let fetched = self
            .exchange
            .fetch_recent_bars(&self.config.symbol, &self.config.timeframe, limit)
            .await?;
        validate_bar_sequence(&fetched, interval)?;

        let forming = fetched
            .last()
            .filter(|bar| bar.timestamp + interval > now)
            .cloned();
        let bars = closed_bars(fetched, interval, now);
        let needed = self.config.min_bars_required();
        if bars.len() < needed {
            return Err(BotError::Data(format!(
                "insufficient bars: {} of {} needed",
                bars.len(),
                needed
            )));
        }

        // Incremental update only when the fetch continues the window
        let continues = match (state.window.last_timestamp(), bars.first()) {
            (Some(last), Some(first)) => first.timestamp <= last + interval,
            _ => false,
        };

        let new_bars = if continues {
            let appended = state.window.merge(&bars)?;
            for bar in &appended {
                state.engine.update(bar);
            }
            appended.len()
        } else {
            self.rewarm(state, &bars)?;
            state.window.len()
        };

        let forming = forming.filter(|_| !self.config.closed_bars_only);
        Ok((new_bars, forming))
    }

    fn rewarm(&self, state: &mut BotState, bars: &[PriceBar]) -> Result<()> {
        if !state.window.is_empty() {
            tracing::warn!("Bar history does not continue the window, recomputing indicators");
        }

        state.window.reset(bars)?;
        state.engine = IndicatorEngine::new(self.config);
        for bar in state.window.bars() {
            state.engine.update(&bar);
        }

        tracing::info!("🔄 Indicators computed over {} bars", state.window.len());
        Ok(())
    }

    fn finish_close(&self, state: &mut BotState, reason: ExitReason, outcome: &CloseOutcome) {
        state.tracker.clear(reason);
        if !outcome.orders_cancelled {
            state.pending_cancel = true;
        }
    }
}

/// A bracket whose prices do not straddle the entry cannot be fixed by retrying
fn repairable(failure: &BracketFailure) -> bool {
    validate_bracket(
        failure.side,
        failure.entry_price,
        failure.stop_price,
        failure.take_profit_price,
    )
    .is_ok()
}

fn entry_blocker(state: &BotState) -> Option<String> {
    if !state.tracker.can_enter() {
        return Some(format!("already {:?}", state.tracker.side()));
    }
    if let Some(exposure) = &state.untracked_exposure {
        return Some(format!(
            "untracked {:?} exposure of {} on the exchange",
            exposure.side, exposure.size
        ));
    }
    if state.pending_cancel {
        return Some("leftover bracket orders not cancelled".to_string());
    }
    None
}
