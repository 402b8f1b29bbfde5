//! Binance USDT-M futures REST client
//!
//! Signed requests follow the usual Binance flow: build the query string,
//! append `timestamp` and `recvWindow`, sign it with HMAC-SHA256 using the API
//! secret and send it with the `X-MBX-APIKEY` header. One-way position mode
//! is assumed (`positionSide = BOTH`).

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;

use super::Exchange;
use crate::config::MarginMode;
use crate::error::BotError;
use crate::models::{
    ExchangePosition, Fill, InstrumentPrecision, OrderHandle, OrderSide, PriceBar, Side,
};
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

// Type alias for the rate limiter to simplify signatures
type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

pub const MAINNET_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";

const REQUESTS_PER_SECOND: u32 = 10;
const RECV_WINDOW_MS: u64 = 5_000;
const HTTP_TIMEOUT_SECS: u64 = 10;

/// "No need to change margin type" / "leverage not modified"
const NO_CHANGE_CODES: [i64; 2] = [-4046, -4059];

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    client_order_id: Option<String>,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    price_precision: u32,
    quantity_precision: u32,
    #[serde(default)]
    filters: Vec<SymbolFilter>,
}

impl SymbolInfo {
    /// Decimals of the step named by `filter_type`, if the filter is present
    fn filter_decimals(&self, filter_type: &str) -> Option<u32> {
        self.filters
            .iter()
            .find(|f| f.filter_type == filter_type)
            .and_then(|f| f.tick_size.as_deref().or(f.step_size.as_deref()))
            .map(step_decimals)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    tick_size: Option<String>,
    step_size: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

/// Conditional order type on Binance futures
#[derive(Debug, Clone, Copy)]
enum ConditionalType {
    StopMarket,
    TakeProfitMarket,
}

impl ConditionalType {
    fn as_str(self) -> &'static str {
        match self {
            ConditionalType::StopMarket => "STOP_MARKET",
            ConditionalType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Signed Binance futures client with rate limiting
///
/// Clones share the rate limiter and the server clock offset.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    rate_limiter: Arc<BinanceRateLimiter>,
    time_offset_ms: Arc<AtomicI64>,
    price_decimals: Arc<AtomicI64>,
    amount_decimals: Arc<AtomicI64>,
}

impl BinanceFuturesClient {
    pub fn new(api_key: String, api_secret: String, testnet: bool) -> Result<Self> {
        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(api_key, api_secret, base_url)
    }

    pub fn with_base_url(api_key: String, api_secret: String, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| BotError::Config(format!("failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(REQUESTS_PER_SECOND)
            .ok_or_else(|| BotError::Config("rate limit must be non-zero".into()))?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            api_key,
            api_secret,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
            time_offset_ms: Arc::new(AtomicI64::new(0)),
            price_decimals: Arc::new(AtomicI64::new(2)),
            amount_decimals: Arc::new(AtomicI64::new(3)),
        })
    }

    /// Measure the offset between the local clock and Binance server time
    pub async fn sync_time(&self) -> Result<i64> {
        let before = Utc::now().timestamp_millis();
        let body = self.public_get("/fapi/v1/time", &[]).await?;
        let after = Utc::now().timestamp_millis();

        let server: ServerTime = serde_json::from_str(&body)?;
        let offset = server.server_time - (before + (after - before) / 2);
        self.time_offset_ms.store(offset, Ordering::Relaxed);

        tracing::info!(offset_ms = offset, "⏰ Synced clock with Binance");
        Ok(offset)
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Sign a query string with HMAC-SHA256
    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| BotError::Config(format!("invalid API secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn format_price(&self, price: f64) -> String {
        let decimals = self.price_decimals.load(Ordering::Relaxed).max(0) as usize;
        format!("{:.*}", decimals, price)
    }

    fn format_amount(&self, amount: f64) -> String {
        let decimals = self.amount_decimals.load(Ordering::Relaxed).max(0) as usize;
        format!("{:.*}", decimals, amount)
    }

    async fn public_get(&self, path: &str, params: &[(&str, String)]) -> Result<String> {
        self.rate_limiter.until_ready().await;

        let query = encode_query(params);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let response = self.client.get(&url).send().await?;
        read_body(response).await
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<String> {
        self.rate_limiter.until_ready().await;

        let mut query = encode_query(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            RECV_WINDOW_MS,
            self.timestamp_ms()
        ));
        let signature = self.sign(&query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        read_body(response).await
    }

    async fn place_conditional(
        &self,
        order_type: ConditionalType,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderHandle> {
        let client_order_id = new_client_order_id();
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", order_type.as_str().to_string()),
            ("stopPrice", self.format_price(stop_price)),
            ("workingType", "MARK_PRICE".to_string()),
            ("newClientOrderId", client_order_id),
        ];
        if close_position {
            params.push(("closePosition", "true".to_string()));
        } else {
            params.push(("quantity", self.format_amount(amount)));
            params.push(("reduceOnly", "true".to_string()));
        }

        let body = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await?;
        let order: OrderResponse = serde_json::from_str(&body)?;

        tracing::info!(
            symbol,
            side = side.as_str(),
            order_type = order_type.as_str(),
            stop_price,
            order_id = order.order_id,
            "Conditional order accepted"
        );

        Ok(OrderHandle {
            order_id: order.order_id.to_string(),
            client_order_id: order.client_order_id,
        })
    }
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    async fn fetch_recent_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<PriceBar>> {
        let body = self
            .public_get(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", timeframe.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(&body)?;
        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn fetch_reference_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        let ticker: TickerPrice = serde_json::from_str(&body)?;
        parse_decimal(&ticker.price, "price")
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        reduce_only: bool,
    ) -> Result<Fill> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", self.format_amount(amount)),
            ("newOrderRespType", "RESULT".to_string()),
            ("newClientOrderId", new_client_order_id()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        tracing::info!(symbol, side = side.as_str(), amount, reduce_only, "Placing MARKET order");

        let body = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await?;
        let order: OrderResponse = serde_json::from_str(&body)?;

        // avgPrice is "0.00" when the response carries no fill yet
        let fill_price = order
            .avg_price
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| *p > 0.0);
        let filled_amount = order
            .executed_qty
            .as_deref()
            .and_then(|q| q.parse::<f64>().ok())
            .unwrap_or(amount);

        tracing::info!(
            order_id = order.order_id,
            status = order.status.as_deref().unwrap_or("UNKNOWN"),
            fill_price = ?fill_price,
            filled_amount,
            "Order filled"
        );

        Ok(Fill {
            order_id: order.order_id.to_string(),
            fill_price,
            filled_amount,
        })
    }

    async fn submit_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderHandle> {
        self.place_conditional(
            ConditionalType::StopMarket,
            symbol,
            side,
            amount,
            stop_price,
            close_position,
        )
        .await
    }

    async fn submit_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
        close_position: bool,
    ) -> Result<OrderHandle> {
        self.place_conditional(
            ConditionalType::TakeProfitMarket,
            symbol,
            side,
            amount,
            stop_price,
            close_position,
        )
        .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        self.signed_request(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &[("symbol", symbol.to_string())],
        )
        .await?;
        tracing::info!(symbol, "Cancelled all open orders");
        Ok(())
    }

    async fn fetch_position(&self, symbol: &str) -> Result<Option<ExchangePosition>> {
        let body = self
            .signed_request(
                Method::GET,
                "/fapi/v2/positionRisk",
                &[("symbol", symbol.to_string())],
            )
            .await?;
        let positions: Vec<PositionRisk> = serde_json::from_str(&body)?;

        for position in positions.into_iter().filter(|p| p.symbol == symbol) {
            let amount = parse_decimal(&position.position_amt, "positionAmt")?;
            if amount.abs() < f64::EPSILON {
                continue;
            }
            return Ok(Some(ExchangePosition {
                side: if amount > 0.0 { Side::Long } else { Side::Short },
                size: amount.abs(),
                entry_price: parse_decimal(&position.entry_price, "entryPrice")?,
            }));
        }
        Ok(None)
    }

    async fn get_instrument_precision(&self, symbol: &str) -> Result<InstrumentPrecision> {
        let body = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        let info: ExchangeInfo = serde_json::from_str(&body)?;

        let symbol_info = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| BotError::exchange(-1121, format!("Invalid symbol {}", symbol)))?;

        // Order validation uses the filters, the precision fields are only a fallback
        let precision = InstrumentPrecision {
            price_decimals: symbol_info
                .filter_decimals("PRICE_FILTER")
                .unwrap_or(symbol_info.price_precision),
            amount_decimals: symbol_info
                .filter_decimals("LOT_SIZE")
                .unwrap_or(symbol_info.quantity_precision),
        };

        self.price_decimals
            .store(precision.price_decimals as i64, Ordering::Relaxed);
        self.amount_decimals
            .store(precision.amount_decimals as i64, Ordering::Relaxed);

        Ok(precision)
    }

    async fn configure_account(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<()> {
        self.signed_request(
            Method::POST,
            "/fapi/v1/leverage",
            &[
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
            ],
        )
        .await?;

        match self
            .signed_request(
                Method::POST,
                "/fapi/v1/marginType",
                &[
                    ("symbol", symbol.to_string()),
                    ("marginType", margin_mode.as_binance().to_string()),
                ],
            )
            .await
        {
            Ok(_) => {}
            Err(BotError::Exchange { code, .. }) if NO_CHANGE_CODES.contains(&code) => {}
            Err(e) => return Err(e),
        }

        tracing::info!(
            symbol,
            leverage,
            margin = margin_mode.as_binance(),
            "✅ Account configured"
        );
        Ok(())
    }
}

async fn read_body(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return Ok(body);
    }

    if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
        return Err(BotError::exchange(api_error.code, api_error.msg));
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
            Err(BotError::exchange(-1003, format!("rate limited (HTTP {})", status)))
        }
        s if s.is_server_error() => Err(BotError::Network(format!("HTTP {}: {}", s, body))),
        s => Err(BotError::exchange(
            i64::from(s.as_u16()),
            format!("HTTP {}: {}", s, body),
        )),
    }
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn new_client_order_id() -> String {
    // Binance limits client ids to 36 chars of [.A-Z:/a-z0-9_-]
    format!("sb-{}", &uuid::Uuid::new_v4().simple().to_string()[..24])
}

/// Decimal places of a tick or step size such as `"0.01000000"`
fn step_decimals(step: &str) -> u32 {
    match step.split_once('.') {
        Some((_, fraction)) => fraction.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

fn parse_decimal(value: &str, field: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| BotError::exchange(0, format!("malformed {} '{}'", field, value)))
}

fn parse_kline(row: &[serde_json::Value]) -> Result<PriceBar> {
    let malformed = || BotError::Data(format!("malformed kline row: {:?}", row));
    if row.len() < 6 {
        return Err(malformed());
    }

    let open_time = row[0].as_i64().ok_or_else(malformed)?;
    let timestamp = Utc
        .timestamp_millis_opt(open_time)
        .single()
        .ok_or_else(malformed)?;
    let field = |i: usize| -> Result<f64> {
        row[i]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(malformed)
    };

    Ok(PriceBar {
        timestamp,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}
