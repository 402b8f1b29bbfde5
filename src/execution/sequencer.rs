use crate::config::StrategyConfig;
use crate::error::{BotError, BracketFailure};
use crate::exchange::Exchange;
use crate::execution::position_tracker::{validate_bracket, ExitReason, Position, PositionTracker};
use crate::models::{round_to, Fill, OrderHandle, Side, Signal};
use crate::Result;

/// "ReduceOnly Order is rejected": nothing left to reduce
const REDUCE_ONLY_REJECTED: i64 = -2022;

/// Outcome of closing a position
#[derive(Debug, Clone, PartialEq)]
pub struct CloseOutcome {
    /// `None` when the exchange reported no position left to close
    pub fill: Option<Fill>,
    /// False when cancelling the resting bracket orders failed
    pub orders_cancelled: bool,
}

/// Stop and take-profit prices for a fill, rounded to price precision
///
/// Offsets are multiplicative: long stop = fill * (1 - sl), long tp =
/// fill * (1 + tp); short is the mirror image.
pub fn bracket_prices(side: Side, fill_price: f64, config: &StrategyConfig) -> (f64, f64) {
    let (stop, take_profit) = match side {
        Side::Long => (
            fill_price * (1.0 - config.stop_loss_pct),
            fill_price * (1.0 + config.take_profit_pct),
        ),
        Side::Short => (
            fill_price * (1.0 + config.stop_loss_pct),
            fill_price * (1.0 - config.take_profit_pct),
        ),
    };
    (
        round_to(stop, config.price_decimals),
        round_to(take_profit, config.price_decimals),
    )
}

/// Issues the entry / bracket / close order sequences
///
/// Every exchange call goes through here so the order of operations and the
/// partial-failure handling live in one place.
pub struct OrderSequencer<'a, E: Exchange + ?Sized> {
    exchange: &'a E,
    config: &'a StrategyConfig,
}

impl<'a, E: Exchange + ?Sized> OrderSequencer<'a, E> {
    pub fn new(exchange: &'a E, config: &'a StrategyConfig) -> Self {
        Self { exchange, config }
    }

    /// Contract amount per entry: `amount * leverage` at amount precision
    pub fn order_size(&self) -> f64 {
        round_to(
            self.config.amount * self.config.leverage as f64,
            self.config.amount_decimals,
        )
    }

    /// Open a bracketed position for `signal`
    ///
    /// The position only exists once the entry and both protective orders
    /// are accepted. If the entry fills but a leg is rejected the result is
    /// [`BotError::BracketFailure`], never a silently open position.
    pub async fn enter(&self, signal: Signal) -> Result<Position> {
        let side = signal
            .side()
            .ok_or_else(|| BotError::InvalidState("no entry for a Hold signal".into()))?;
        let symbol = self.config.symbol.as_str();

        let reference_price = self.exchange.fetch_reference_price(symbol).await?;
        let size = self.order_size();
        if size <= 0.0 {
            return Err(BotError::Config(format!(
                "order size {} x {} rounds to zero at {} decimals",
                self.config.amount, self.config.leverage, self.config.amount_decimals
            )));
        }

        tracing::info!(
            "⚡ {:?} signal on {} at ~{:.4}, sending MARKET {} {}",
            signal,
            symbol,
            reference_price,
            side.entry_order().as_str(),
            size
        );

        let fill = self
            .exchange
            .submit_market_order(symbol, side.entry_order(), size, false)
            .await
            .inspect_err(|e| {
                tracing::error!(symbol, signal = ?signal, "❌ Entry order failed: {}", e);
            })?;

        let entry_price = match fill.fill_price {
            Some(price) => price,
            None => {
                tracing::warn!(
                    order_id = %fill.order_id,
                    "Exchange reported no fill price, using reference {:.4}",
                    reference_price
                );
                reference_price
            }
        };
        let filled = if fill.filled_amount > 0.0 {
            fill.filled_amount
        } else {
            size
        };

        let (stop_price, take_profit_price) = bracket_prices(side, entry_price, self.config);

        let mut failure = BracketFailure {
            symbol: symbol.to_string(),
            side,
            entry_price,
            size: filled,
            stop_price,
            take_profit_price,
            stop_order_id: None,
            take_profit_order_id: None,
            cause: String::new(),
            repair_attempts: 0,
        };

        if let Err(e) = validate_bracket(side, entry_price, stop_price, take_profit_price) {
            failure.cause = e.to_string();
            return Err(failure.into());
        }

        self.place_missing_legs(&mut failure).await;

        match Position::from_repaired(&failure) {
            Ok(position) => {
                tracing::info!(
                    "🛡️ Protection placed - SL: {:.4} | TP: {:.4}",
                    stop_price,
                    take_profit_price
                );
                Ok(position)
            }
            Err(_) => Err(failure.into()),
        }
    }

    /// Retry only the legs a failed bracket is missing
    ///
    /// Returns the protected position once both legs exist; otherwise the
    /// failure is updated in place and returned as the error.
    pub async fn repair(&self, failure: &mut BracketFailure) -> Result<Position> {
        failure.repair_attempts += 1;
        tracing::warn!(
            attempt = failure.repair_attempts,
            "🔧 Repairing bracket: placing {}",
            failure.missing_legs().join(" + ")
        );

        failure.cause.clear();
        self.place_missing_legs(failure).await;

        Position::from_repaired(failure).map_err(|_| failure.clone().into())
    }

    async fn place_missing_legs(&self, failure: &mut BracketFailure) {
        let symbol = failure.symbol.as_str();
        let exit = failure.side.exit_order();
        let mut causes = Vec::new();

        // Both legs are attempted even when the first one is rejected
        if failure.stop_order_id.is_none() {
            match self
                .exchange
                .submit_stop_order(symbol, exit, failure.size, failure.stop_price, true)
                .await
            {
                Ok(OrderHandle { order_id, .. }) => failure.stop_order_id = Some(order_id),
                Err(e) => {
                    tracing::error!(
                        symbol,
                        stop = failure.stop_price,
                        "❌ Stop-loss rejected: {}",
                        e
                    );
                    causes.push(format!("stop-loss: {}", e));
                }
            }
        }

        if failure.take_profit_order_id.is_none() {
            match self
                .exchange
                .submit_take_profit_order(
                    symbol,
                    exit,
                    failure.size,
                    failure.take_profit_price,
                    true,
                )
                .await
            {
                Ok(OrderHandle { order_id, .. }) => failure.take_profit_order_id = Some(order_id),
                Err(e) => {
                    tracing::error!(
                        symbol,
                        take_profit = failure.take_profit_price,
                        "❌ Take-profit rejected: {}",
                        e
                    );
                    causes.push(format!("take-profit: {}", e));
                }
            }
        }

        if !causes.is_empty() {
            failure.cause = causes.join("; ");
        }
    }

    /// Reduce-only market close, then cancel the resting bracket orders
    pub async fn close(&self, side: Side, size: f64) -> Result<CloseOutcome> {
        let symbol = self.config.symbol.as_str();
        tracing::info!("⚠️ Closing {:?} {} size {}", side, symbol, size);

        let fill = match self
            .exchange
            .submit_market_order(symbol, side.exit_order(), size, true)
            .await
        {
            Ok(fill) => Some(fill),
            Err(BotError::Exchange { code, .. }) if code == REDUCE_ONLY_REJECTED => {
                tracing::warn!(symbol, "Nothing to close, position already gone");
                None
            }
            Err(e) => return Err(e),
        };

        let orders_cancelled = match self.exchange.cancel_all_orders(symbol).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(symbol, "Failed to cancel bracket orders after close: {}", e);
                false
            }
        };

        if let Some(fill) = &fill {
            tracing::info!(
                order_id = %fill.order_id,
                "🔚 Closed {:?} {} at {}",
                side,
                symbol,
                fill.fill_price
                    .map(|p| format!("{:.4}", p))
                    .unwrap_or_else(|| "unknown price".to_string())
            );
        }

        Ok(CloseOutcome {
            fill,
            orders_cancelled,
        })
    }

    /// Single attempt to close whatever the tracker holds
    ///
    /// The tracker goes Flat as soon as the close order is accepted.
    pub async fn flatten(
        &self,
        tracker: &mut PositionTracker,
        reason: ExitReason,
    ) -> Result<Option<CloseOutcome>> {
        let Some((side, size)) = tracker.exposure() else {
            return Ok(None);
        };

        tracing::warn!(reason = ?reason, "🛑 Flattening {:?} position of {}", side, size);
        let outcome = self.close(side, size).await?;
        tracker.clear(reason);
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FailPoint, OrderKind, PaperExchange};
    use crate::models::PriceBar;
    use chrono::{Duration, Utc};

    fn config() -> StrategyConfig {
        StrategyConfig {
            symbol: "ETHUSDT".to_string(),
            amount: 0.05,
            leverage: 10,
            stop_loss_pct: 0.008,
            take_profit_pct: 0.015,
            price_decimals: 2,
            amount_decimals: 3,
            ..Default::default()
        }
    }

    fn exchange_at(price: f64) -> PaperExchange {
        PaperExchange::new().with_bars(vec![PriceBar {
            timestamp: Utc::now() - Duration::minutes(10),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000.0,
        }])
    }

    #[test]
    fn test_bracket_prices() {
        let cfg = config();
        assert_eq!(bracket_prices(Side::Long, 2000.0, &cfg), (1984.0, 2030.0));
        assert_eq!(bracket_prices(Side::Short, 2000.0, &cfg), (2016.0, 1970.0));
    }

    #[test]
    fn test_order_size_is_rounded() {
        let cfg = StrategyConfig {
            amount: 0.0333,
            leverage: 3,
            amount_decimals: 3,
            ..config()
        };
        let exchange = PaperExchange::new();
        assert_eq!(OrderSequencer::new(&exchange, &cfg).order_size(), 0.1);
    }

    #[tokio::test]
    async fn test_long_entry_brackets_fill() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        let position = OrderSequencer::new(&exchange, &cfg)
            .enter(Signal::Buy)
            .await
            .unwrap();

        assert_eq!(position.side, Side::Long);
        assert_eq!(position.size, 0.5);
        assert!(position.stop_price < position.entry_price);
        assert!(position.entry_price < position.take_profit_price);

        let orders = exchange.orders();
        let kinds: Vec<OrderKind> = orders.iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            vec![OrderKind::Market, OrderKind::StopMarket, OrderKind::TakeProfitMarket]
        );
        assert_eq!(exchange.open_order_count(), 2);
    }

    #[tokio::test]
    async fn test_short_entry_brackets_fill() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        let position = OrderSequencer::new(&exchange, &cfg)
            .enter(Signal::Sell)
            .await
            .unwrap();

        assert_eq!(position.side, Side::Short);
        assert!(position.stop_price > position.entry_price);
        assert!(position.entry_price > position.take_profit_price);
    }

    #[tokio::test]
    async fn test_brackets_use_fill_price_not_reference() {
        let cfg = config();
        let exchange = exchange_at(2000.0).with_slippage(0.001);
        let position = OrderSequencer::new(&exchange, &cfg)
            .enter(Signal::Buy)
            .await
            .unwrap();

        assert!((position.entry_price - 2002.0).abs() < 1e-9);
        assert_eq!(position.stop_price, round_to(2002.0 * 0.992, 2));
        assert_eq!(position.take_profit_price, round_to(2002.0 * 1.015, 2));
    }

    #[tokio::test]
    async fn test_hold_cannot_enter() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        let result = OrderSequencer::new(&exchange, &cfg).enter(Signal::Hold).await;
        assert!(matches!(result, Err(BotError::InvalidState(_))));
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_entry_failure_opens_nothing() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        exchange.fail_next(
            FailPoint::MarketOrder,
            BotError::exchange(-2019, "Margin is insufficient."),
        );

        let result = OrderSequencer::new(&exchange, &cfg).enter(Signal::Buy).await;
        assert!(matches!(result, Err(BotError::Exchange { code: -2019, .. })));
        assert!(exchange.position().is_none());
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_is_bracket_failure() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        exchange.fail_next(FailPoint::StopOrder, BotError::Network("timeout".into()));

        let result = OrderSequencer::new(&exchange, &cfg).enter(Signal::Buy).await;
        let failure = match result {
            Err(BotError::BracketFailure(f)) => f,
            other => panic!("expected bracket failure, got {:?}", other),
        };

        // Take-profit was still attempted
        assert_eq!(failure.missing_legs(), vec!["stop-loss"]);
        assert!(failure.take_profit_order_id.is_some());
        assert!(failure.cause.contains("stop-loss"));
        assert!(exchange.position().is_some());
    }

    #[tokio::test]
    async fn test_repair_places_only_missing_leg() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        exchange.fail_next(FailPoint::TakeProfitOrder, BotError::Network("timeout".into()));

        let sequencer = OrderSequencer::new(&exchange, &cfg);
        let mut failure = match sequencer.enter(Signal::Sell).await {
            Err(BotError::BracketFailure(f)) => *f,
            other => panic!("expected bracket failure, got {:?}", other),
        };

        let position = sequencer.repair(&mut failure).await.unwrap();
        assert_eq!(failure.repair_attempts, 1);
        assert_eq!(position.side, Side::Short);

        let stops = exchange
            .orders()
            .iter()
            .filter(|o| o.kind == OrderKind::StopMarket)
            .count();
        assert_eq!(stops, 1);
        assert_eq!(exchange.open_order_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_repair_keeps_failure() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        exchange.fail_next(FailPoint::StopOrder, BotError::Network("timeout".into()));
        exchange.fail_next(FailPoint::StopOrder, BotError::Network("timeout again".into()));

        let sequencer = OrderSequencer::new(&exchange, &cfg);
        let mut failure = match sequencer.enter(Signal::Buy).await {
            Err(BotError::BracketFailure(f)) => *f,
            other => panic!("expected bracket failure, got {:?}", other),
        };

        let result = sequencer.repair(&mut failure).await;
        assert!(matches!(result, Err(BotError::BracketFailure(_))));
        assert_eq!(failure.repair_attempts, 1);
        assert!(failure.cause.contains("timeout again"));
    }

    #[tokio::test]
    async fn test_close_sends_reduce_only_then_cancels() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        let sequencer = OrderSequencer::new(&exchange, &cfg);
        let position = sequencer.enter(Signal::Buy).await.unwrap();

        let outcome = sequencer.close(position.side, position.size).await.unwrap();
        assert!(outcome.fill.is_some());
        assert!(outcome.orders_cancelled);
        assert!(exchange.position().is_none());
        assert_eq!(exchange.open_order_count(), 0);

        let last = exchange.orders().pop().unwrap();
        assert_eq!(last.kind, OrderKind::Market);
        assert!(last.reduce_only);
    }

    #[tokio::test]
    async fn test_close_when_already_flat() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        let outcome = OrderSequencer::new(&exchange, &cfg)
            .close(Side::Long, 0.5)
            .await
            .unwrap();
        assert!(outcome.fill.is_none());
        assert_eq!(exchange.cancel_calls(), 1);
    }

    #[tokio::test]
    async fn test_flatten_clears_tracker() {
        let cfg = config();
        let exchange = exchange_at(2000.0);
        let sequencer = OrderSequencer::new(&exchange, &cfg);

        let mut tracker = PositionTracker::new();
        tracker.open(sequencer.enter(Signal::Sell).await.unwrap()).unwrap();

        let outcome = sequencer
            .flatten(&mut tracker, ExitReason::Shutdown)
            .await
            .unwrap();
        assert!(outcome.is_some());
        assert!(tracker.is_flat());

        // Nothing left to flatten
        assert!(sequencer
            .flatten(&mut tracker, ExitReason::Shutdown)
            .await
            .unwrap()
            .is_none());
    }
}
