use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::synthetic::SyntheticMarket;
use super::Exchange;
use crate::config::MarginMode;
use crate::error::BotError;
use crate::models::{
    ExchangePosition, Fill, InstrumentPrecision, OrderHandle, OrderSide, PriceBar, Side,
};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    StopMarket,
    TakeProfitMarket,
}

/// Exchange call that can be made to fail in tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    FetchBars,
    FetchPrice,
    MarketOrder,
    StopOrder,
    TakeProfitOrder,
    CancelOrders,
    FetchPosition,
}

/// Every order the paper account accepted, in submission order
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedOrder {
    pub id: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub amount: f64,
    pub stop_price: Option<f64>,
    pub fill_price: Option<f64>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    id: String,
    kind: OrderKind,
    side: OrderSide,
    amount: f64,
    stop_price: f64,
    close_position: bool,
}

#[derive(Debug, Default)]
struct PaperState {
    bars: Vec<PriceBar>,
    position: Option<ExchangePosition>,
    resting: Vec<RestingOrder>,
    orders: Vec<SubmittedOrder>,
    failures: VecDeque<(FailPoint, BotError)>,
    next_id: u64,
    leverage: Option<u32>,
    cancel_calls: usize,
    market: Option<(SyntheticMarket, Duration)>,
}

/// In-memory futures account for paper trading and tests
///
/// Market orders fill at the last close (plus optional slippage). Resting
/// stop / take-profit orders trigger when a later bar trades through them.
/// Filled brackets leave the sibling order resting, like Binance does.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    precision: InstrumentPrecision,
    slippage_pct: f64,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            precision: InstrumentPrecision {
                price_decimals: 2,
                amount_decimals: 3,
            },
            slippage_pct: 0.0,
        }
    }

    pub fn with_bars(self, bars: Vec<PriceBar>) -> Self {
        for bar in bars {
            self.push_bar(bar);
        }
        self
    }

    /// Generate bars from a synthetic market as wall-clock time passes
    pub fn with_market(self, market: SyntheticMarket, interval: Duration, history: usize) -> Self {
        {
            let mut state = self.lock();
            let mut market = market;
            let minutes = interval.num_minutes().max(1);
            state.bars = market.generate(history, minutes);
            state.market = Some((market, interval));
        }
        self
    }

    pub fn with_precision(mut self, precision: InstrumentPrecision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_slippage(mut self, slippage_pct: f64) -> Self {
        self.slippage_pct = slippage_pct;
        self
    }

    /// Append a bar and trigger any resting orders it trades through
    pub fn push_bar(&self, bar: PriceBar) {
        let mut state = self.lock();
        state.trigger_resting(&bar);
        state.bars.push(bar);
    }

    /// Make the next call at `point` fail with `error`
    pub fn fail_next(&self, point: FailPoint, error: BotError) {
        self.lock().failures.push_back((point, error));
    }

    pub fn orders(&self) -> Vec<SubmittedOrder> {
        self.lock().orders.clone()
    }

    pub fn position(&self) -> Option<ExchangePosition> {
        self.lock().position.clone()
    }

    pub fn open_order_count(&self) -> usize {
        self.lock().resting.len()
    }

    pub fn cancel_calls(&self) -> usize {
        self.lock().cancel_calls
    }

    pub fn leverage(&self) -> Option<u32> {
        self.lock().leverage
    }

    /// Force a position onto the account without going through orders
    pub fn set_position(&self, position: Option<ExchangePosition>) {
        self.lock().position = position;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        // A poisoned lock only means a test panicked mid-call
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperState {
    fn take_failure(&mut self, point: FailPoint) -> Result<()> {
        if let Some(idx) = self.failures.iter().position(|(p, _)| *p == point) {
            if let Some((_, err)) = self.failures.remove(idx) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn last_price(&self) -> Result<f64> {
        self.bars
            .last()
            .map(|b| b.close)
            .ok_or_else(|| BotError::Data("paper exchange has no bars".into()))
    }

    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("paper-{}", self.next_id)
    }

    fn advance_market(&mut self) {
        let Some((market, interval)) = self.market.as_mut() else {
            return;
        };
        let interval = *interval;
        let now = Utc::now();
        let mut new_bars = Vec::new();
        let mut next_open = match self.bars.last() {
            Some(bar) => bar.timestamp + interval,
            None => now - interval,
        };
        // Only emit bars that have closed
        while next_open + interval <= now {
            new_bars.push(market.next_bar(next_open));
            next_open += interval;
        }
        for bar in new_bars {
            self.trigger_resting(&bar);
            self.bars.push(bar);
        }
    }

    fn trigger_resting(&mut self, bar: &PriceBar) {
        let Some(position) = self.position.clone() else {
            return;
        };

        // Stop checked before take-profit when one bar spans both
        let mut ordered: Vec<RestingOrder> = self.resting.clone();
        ordered.sort_by_key(|o| match o.kind {
            OrderKind::StopMarket => 0,
            _ => 1,
        });

        for order in ordered {
            if order.side != position.side.exit_order() {
                continue;
            }
            let hit = match (position.side, order.kind) {
                (Side::Long, OrderKind::StopMarket) => bar.low <= order.stop_price,
                (Side::Long, OrderKind::TakeProfitMarket) => bar.high >= order.stop_price,
                (Side::Short, OrderKind::StopMarket) => bar.high >= order.stop_price,
                (Side::Short, OrderKind::TakeProfitMarket) => bar.low <= order.stop_price,
                (_, OrderKind::Market) => false,
            };
            if hit {
                tracing::debug!(
                    order_id = %order.id,
                    kind = ?order.kind,
                    price = order.stop_price,
                    "Paper order triggered"
                );
                self.resting.retain(|o| o.id != order.id);
                let amount = if order.close_position {
                    position.size
                } else {
                    order.amount.min(position.size)
                };
                self.reduce_position(amount);
                break;
            }
        }
    }

    fn reduce_position(&mut self, amount: f64) {
        if let Some(position) = self.position.as_mut() {
            position.size -= amount;
            if position.size <= 1e-12 {
                self.position = None;
            }
        }
    }

    fn record_conditional(
        &mut self,
        kind: OrderKind,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderHandle> {
        let last = self.last_price()?;
        // Binance rejects conditional orders that would trigger immediately
        let immediate = match (kind, side) {
            (OrderKind::StopMarket, OrderSide::Sell) => stop_price >= last,
            (OrderKind::StopMarket, OrderSide::Buy) => stop_price <= last,
            (OrderKind::TakeProfitMarket, OrderSide::Sell) => stop_price <= last,
            (OrderKind::TakeProfitMarket, OrderSide::Buy) => stop_price >= last,
            (OrderKind::Market, _) => false,
        };
        if immediate {
            return Err(BotError::exchange(-2021, "Order would immediately trigger."));
        }

        let id = self.next_order_id();
        self.resting.push(RestingOrder {
            id: id.clone(),
            kind,
            side,
            amount,
            stop_price,
            close_position,
        });
        self.orders.push(SubmittedOrder {
            id: id.clone(),
            kind,
            side,
            amount,
            stop_price: Some(stop_price),
            fill_price: None,
            reduce_only: true,
        });
        Ok(OrderHandle {
            order_id: id,
            client_order_id: None,
        })
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn fetch_recent_bars(
        &self,
        _symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> Result<Vec<PriceBar>> {
        let mut state = self.lock();
        state.take_failure(FailPoint::FetchBars)?;
        state.advance_market();
        let start = state.bars.len().saturating_sub(limit);
        Ok(state.bars[start..].to_vec())
    }

    async fn fetch_reference_price(&self, _symbol: &str) -> Result<f64> {
        let mut state = self.lock();
        state.take_failure(FailPoint::FetchPrice)?;
        state.last_price()
    }

    async fn submit_market_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        amount: f64,
        reduce_only: bool,
    ) -> Result<Fill> {
        let mut state = self.lock();
        state.take_failure(FailPoint::MarketOrder)?;
        if amount <= 0.0 {
            return Err(BotError::exchange(-4003, "Quantity less than or equal to zero."));
        }

        let last = state.last_price()?;
        let fill_price = match side {
            OrderSide::Buy => last * (1.0 + self.slippage_pct),
            OrderSide::Sell => last * (1.0 - self.slippage_pct),
        };

        match state.position.clone() {
            None if reduce_only => {
                return Err(BotError::exchange(-2022, "ReduceOnly Order is rejected."));
            }
            None => {
                let position_side = match side {
                    OrderSide::Buy => Side::Long,
                    OrderSide::Sell => Side::Short,
                };
                state.position = Some(ExchangePosition {
                    side: position_side,
                    size: amount,
                    entry_price: fill_price,
                });
            }
            Some(position) if position.side.exit_order() == side => {
                state.reduce_position(amount.min(position.size));
            }
            Some(position) => {
                if reduce_only {
                    return Err(BotError::exchange(-2022, "ReduceOnly Order is rejected."));
                }
                let size = position.size + amount;
                let entry_price =
                    (position.entry_price * position.size + fill_price * amount) / size;
                state.position = Some(ExchangePosition {
                    side: position.side,
                    size,
                    entry_price,
                });
            }
        }

        let id = state.next_order_id();
        state.orders.push(SubmittedOrder {
            id: id.clone(),
            kind: OrderKind::Market,
            side,
            amount,
            stop_price: None,
            fill_price: Some(fill_price),
            reduce_only,
        });

        Ok(Fill {
            order_id: id,
            fill_price: Some(fill_price),
            filled_amount: amount,
        })
    }

    async fn submit_stop_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderHandle> {
        let mut state = self.lock();
        state.take_failure(FailPoint::StopOrder)?;
        state.record_conditional(OrderKind::StopMarket, side, amount, stop_price, close_position)
    }

    async fn submit_take_profit_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderHandle> {
        let mut state = self.lock();
        state.take_failure(FailPoint::TakeProfitOrder)?;
        state.record_conditional(
            OrderKind::TakeProfitMarket,
            side,
            amount,
            stop_price,
            close_position,
        )
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> Result<()> {
        let mut state = self.lock();
        state.cancel_calls += 1;
        state.take_failure(FailPoint::CancelOrders)?;
        state.resting.clear();
        Ok(())
    }

    async fn fetch_position(&self, _symbol: &str) -> Result<Option<ExchangePosition>> {
        let mut state = self.lock();
        state.take_failure(FailPoint::FetchPosition)?;
        Ok(state.position.clone())
    }

    async fn get_instrument_precision(&self, _symbol: &str) -> Result<InstrumentPrecision> {
        Ok(self.precision)
    }

    async fn configure_account(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<()> {
        tracing::info!(symbol, leverage, margin_mode = ?margin_mode, "Paper account configured");
        self.lock().leverage = Some(leverage);
        Ok(())
    }
}
