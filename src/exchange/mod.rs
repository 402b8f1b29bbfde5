// Exchange boundary: everything the trading core needs from a futures venue
pub mod binance;
pub mod paper;
pub mod synthetic;

use async_trait::async_trait;

use crate::config::MarginMode;
use crate::models::{ExchangePosition, Fill, InstrumentPrecision, OrderHandle, OrderSide, PriceBar};
use crate::Result;

pub use binance::BinanceFuturesClient;
pub use paper::{FailPoint, OrderKind, PaperExchange, SubmittedOrder};
pub use synthetic::{MarketScenario, SyntheticMarket};

/// Operations the trading core performs against a leveraged futures exchange
///
/// Failures are reported as [`crate::BotError::Network`] or
/// [`crate::BotError::Exchange`].
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Most recent bars, oldest first
    async fn fetch_recent_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<PriceBar>>;

    /// Last traded price
    async fn fetch_reference_price(&self, symbol: &str) -> Result<f64>;

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        reduce_only: bool,
    ) -> Result<Fill>;

    /// Stop-market order; with `close_position` it closes the whole position
    async fn submit_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderHandle>;

    async fn submit_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderHandle>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    /// Open position reported by the exchange, `None` when flat
    async fn fetch_position(&self, symbol: &str) -> Result<Option<ExchangePosition>>;

    async fn get_instrument_precision(&self, symbol: &str) -> Result<InstrumentPrecision>;

    /// Set leverage and margin mode before the first trade
    async fn configure_account(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<()>;
}
