use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tracing::{debug, error, info};
use url::Url;

use common::{
    Balance, Candle, CandleInterval, CandleQuery, Config, Credentials, Error, ExchangeAdapter,
    ExchangeError, ExchangeFactory, OrderRef, OrderRequest, OrderResult, OrderSide, Result,
    SymbolInfo, Ticker, TradingMode, TradingPair,
};

use super::models::{
    parse_status, value_to_f64, value_to_i64, BingXBalanceData, BingXKline, BingXOrder,
    BingXResponse, BingXSymbolsData, BingXTicker,
};
use crate::rest::{RateLimiter, RestConfig, SignedClient};

pub const BINGX_BASE_URL: &str = "https://open-api.bingx.com";
/// Demo trading host used for testnet credentials.
pub const BINGX_TESTNET_URL: &str = "https://open-api-vst.bingx.com";
const API_KEY_HEADER: &str = "X-BX-APIKEY";

const ORDER: &str = "/openApi/spot/v1/trade/order";
const CANCEL: &str = "/openApi/spot/v1/trade/cancel";
const QUERY: &str = "/openApi/spot/v1/trade/query";
const BALANCE: &str = "/openApi/spot/v1/account/balance";
const TICKER: &str = "/openApi/spot/v1/ticker/24hr";
const SYMBOLS: &str = "/openApi/spot/v1/common/symbols";
const KLINES: &str = "/openApi/spot/v2/market/kline";

/// BingX spot adapter bound to one account.
pub struct BingXAdapter {
    client: SignedClient,
}

impl BingXAdapter {
    pub fn new(client: SignedClient) -> Self {
        Self { client }
    }

    /// `BTC/USDT` → `BTC-USDT`.
    fn exchange_symbol(symbol: &str) -> Result<String, ExchangeError> {
        TradingPair::parse(symbol)
            .map(|pair| pair.joined("-"))
            .map_err(|e| ExchangeError::Unsupported(e.to_string()))
    }

    fn order_result(
        order: BingXOrder,
        symbol: &str,
        side: Option<OrderSide>,
    ) -> Result<OrderResult, ExchangeError> {
        let side = match side {
            Some(side) => side,
            None => parse_side(&order.side)?,
        };
        Ok(OrderResult {
            status: parse_status(&order.status)?,
            price: order.effective_price(),
            timestamp: order.timestamp(),
            quantity: order.orig_qty,
            client_order_id: order.client_order_id,
            order_id: order.order_id,
            symbol: symbol.to_string(),
            side,
        })
    }

    async fn place(&self, order: &OrderRequest, order_type: &str) -> Result<OrderResult, ExchangeError> {
        order.validate()?;
        let mut params = vec![
            ("symbol", Self::exchange_symbol(&order.symbol)?),
            ("side", order.side.to_string()),
            ("type", order_type.to_string()),
            ("quantity", order.quantity.to_string()),
            ("newClientOrderId", order.client_order_id.clone()),
        ];
        if let Some(price) = order.price {
            params.push(("price", price.to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            client_order_id = %order.client_order_id,
            order_type,
            "Submitting order to BingX"
        );
        let resp: BingXResponse<BingXOrder> = self.client.post(ORDER, &params, true).await?;
        let mut placed = Self::order_result(resp.into_data()?, &order.symbol, Some(order.side))?;
        if placed.client_order_id.is_none() {
            placed.client_order_id = Some(order.client_order_id.clone());
        }
        if placed.quantity <= 0.0 {
            placed.quantity = order.quantity;
        }
        Ok(placed)
    }

    fn order_ref_param(order: &OrderRef) -> (&'static str, String) {
        match order {
            OrderRef::Exchange(id) => ("orderId", id.clone()),
            OrderRef::Client(id) => ("clientOrderID", id.clone()),
        }
    }
}

fn parse_side(raw: &str) -> Result<OrderSide, ExchangeError> {
    match raw.to_ascii_uppercase().as_str() {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(ExchangeError::Unknown(format!("unrecognized side '{other}'"))),
    }
}

/// `BTC-USDT` → `BTC/USDT`, the notation bots use.
fn bot_symbol(raw: &str) -> String {
    raw.replace('-', "/")
}

fn parse_kline(row: &BingXKline) -> Option<Candle> {
    let ms = |i: usize| row.get(i).and_then(value_to_i64);
    let num = |i: usize| row.get(i).and_then(value_to_f64);
    let open_time = Utc.timestamp_millis_opt(ms(0)?).single()?;
    let close_time = Utc.timestamp_millis_opt(ms(6)?).single()?;
    Some(Candle {
        open_time,
        close_time,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

#[async_trait]
impl ExchangeAdapter for BingXAdapter {
    fn name(&self) -> &str {
        "bingx"
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        if order.price.is_some() {
            return Err(ExchangeError::InvalidOrder("market order with a price".into()));
        }
        self.place(order, "MARKET").await
    }

    async fn place_limit_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        if order.price.is_none() {
            return Err(ExchangeError::InvalidOrder("limit order without a price".into()));
        }
        self.place(order, "LIMIT").await
    }

    async fn cancel_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderResult, ExchangeError> {
        let params = [
            ("symbol", Self::exchange_symbol(symbol)?),
            Self::order_ref_param(order),
        ];
        let resp: BingXResponse<BingXOrder> = self.client.post(CANCEL, &params, true).await?;
        Self::order_result(resp.into_order_data(&order.to_string())?, symbol, None)
    }

    async fn get_order_status(&self, symbol: &str, order: &OrderRef) -> Result<OrderResult, ExchangeError> {
        let params = [
            ("symbol", Self::exchange_symbol(symbol)?),
            Self::order_ref_param(order),
        ];
        let resp: BingXResponse<BingXOrder> = self.client.get(QUERY, &params, true).await?;
        Self::order_result(resp.into_order_data(&order.to_string())?, symbol, None)
    }

    async fn get_balance(&self, asset: &str) -> Balance {
        self.get_all_balances()
            .await
            .into_iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .unwrap_or_else(|| Balance::empty(asset))
    }

    async fn get_all_balances(&self) -> Vec<Balance> {
        let data = match self.client.get::<BingXResponse<BingXBalanceData>>(BALANCE, &[], true).await {
            Ok(resp) => resp.into_data(),
            Err(e) => Err(e.into()),
        };
        match data {
            Ok(data) => {
                let balances: Vec<Balance> = data
                    .balances
                    .into_iter()
                    .map(|b| Balance {
                        total: b.free + b.locked,
                        available: b.free,
                        locked: b.locked,
                        asset: b.asset,
                    })
                    .filter(|b| b.total > 0.0)
                    .collect();
                debug!(count = balances.len(), "Fetched balances from BingX");
                balances
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch balances from BingX");
                Vec::new()
            }
        }
    }

    async fn get_ticker(&self, symbol: &str) -> Option<Ticker> {
        let exchange_symbol = match Self::exchange_symbol(symbol) {
            Ok(s) => s,
            Err(e) => {
                error!(symbol, error = %e, "Cannot fetch ticker");
                return None;
            }
        };
        let params = [
            ("symbol", exchange_symbol),
            ("timestamp", Utc::now().timestamp_millis().to_string()),
        ];
        let data = match self.client.get::<BingXResponse<Vec<BingXTicker>>>(TICKER, &params, false).await {
            Ok(resp) => resp.into_data(),
            Err(e) => Err(e.into()),
        };
        match data {
            Ok(tickers) => {
                let t = tickers.into_iter().next()?;
                let timestamp = t
                    .close_time
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or_else(Utc::now);
                Some(Ticker {
                    symbol: symbol.to_string(),
                    last_price: t.last_price,
                    bid_price: t.bid_price,
                    ask_price: t.ask_price,
                    volume_24h: t.volume,
                    timestamp,
                })
            }
            Err(e) => {
                error!(symbol, error = %e, "Failed to fetch ticker from BingX");
                None
            }
        }
    }

    async fn get_candles(&self, symbol: &str, interval: CandleInterval, query: CandleQuery) -> Vec<Candle> {
        let exchange_symbol = match Self::exchange_symbol(symbol) {
            Ok(s) => s,
            Err(e) => {
                error!(symbol, error = %e, "Cannot fetch candles");
                return Vec::new();
            }
        };
        let mut params = vec![
            ("symbol", exchange_symbol),
            ("interval", interval.as_str().to_string()),
            ("timestamp", Utc::now().timestamp_millis().to_string()),
        ];
        if let Some(start) = query.start {
            params.push(("startTime", start.timestamp_millis().to_string()));
        }
        if let Some(end) = query.end {
            params.push(("endTime", end.timestamp_millis().to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        let data = match self.client.get::<BingXResponse<Vec<BingXKline>>>(KLINES, &params, false).await {
            Ok(resp) => resp.into_data(),
            Err(e) => Err(e.into()),
        };
        match data {
            Ok(rows) => {
                let mut candles: Vec<Candle> = rows.iter().filter_map(parse_kline).collect();
                candles.sort_by_key(|c| c.open_time);
                candles
            }
            Err(e) => {
                error!(symbol, error = %e, "Failed to fetch candles from BingX");
                Vec::new()
            }
        }
    }

    async fn get_symbols(&self) -> Vec<SymbolInfo> {
        let data = match self.client.get::<BingXResponse<BingXSymbolsData>>(SYMBOLS, &[], false).await {
            Ok(resp) => resp.into_data(),
            Err(e) => Err(e.into()),
        };
        match data {
            Ok(data) => {
                let symbols: Vec<SymbolInfo> = data
                    .symbols
                    .into_iter()
                    .filter(|s| s.status == 1)
                    .map(|s| {
                        let (base, quote) = match s.symbol.split_once('-') {
                            _ if !s.asset.is_empty() && !s.currency.is_empty() => {
                                (s.asset.clone(), s.currency.clone())
                            }
                            Some((b, q)) => (b.to_string(), q.to_string()),
                            None => (s.symbol.clone(), String::new()),
                        };
                        SymbolInfo {
                            name: bot_symbol(&s.symbol),
                            base_asset: base,
                            quote_asset: quote,
                            min_quantity: s.min_qty,
                            max_quantity: s.max_qty,
                            quantity_step: s.step_size,
                            min_price: 0.0,
                            max_price: 0.0,
                            price_step: s.tick_size,
                            is_active: true,
                        }
                    })
                    .collect();
                debug!(count = symbols.len(), "Fetched symbols from BingX");
                symbols
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch symbols from BingX");
                Vec::new()
            }
        }
    }
}

/// Rate-limit scope: one api key on one host.
type AccountKey = (String, bool);

/// Builds [`BingXAdapter`]s. Testnet credentials route to the demo host.
///
/// Adapters share one connection pool, and adapters of the same account
/// share one [`RateLimiter`], so every bot on an account honours the
/// cooldown after a 429/418.
pub struct BingXFactory {
    base_url: Url,
    testnet_url: Url,
    recv_window_ms: u64,
    timeout: Duration,
    max_requests_per_sec: u32,
    http: reqwest::Client,
    limiters: Mutex<HashMap<AccountKey, Arc<RateLimiter>>>,
}

impl BingXFactory {
    pub fn from_config(config: &Config) -> Result<Self> {
        let testnet_url = Url::parse(BINGX_TESTNET_URL)
            .map_err(|e| Error::Config(format!("testnet url: {e}")))?;
        Ok(Self {
            base_url: config.bingx_base_url.clone(),
            testnet_url,
            recv_window_ms: config.recv_window_ms,
            timeout: config.http_timeout,
            max_requests_per_sec: config.max_requests_per_sec,
            http: SignedClient::http_client(config.http_timeout)
                .map_err(|e| Error::Config(format!("bingx http client: {e}")))?,
            limiters: Mutex::new(HashMap::new()),
        })
    }

    fn limiter(&self, api_key: &str, testnet: bool) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        limiters
            .entry((api_key.to_string(), testnet))
            .or_insert_with(|| Arc::new(RateLimiter::per_second(self.max_requests_per_sec)))
            .clone()
    }

    fn client(&self, credentials: Option<Credentials>) -> SignedClient {
        let (api_key, testnet) = credentials
            .as_ref()
            .map_or(("", false), |c| (c.api_key.as_str(), c.is_testnet));
        let limiter = self.limiter(api_key, testnet);
        SignedClient::with_shared(self.rest_config(testnet), credentials, self.http.clone(), limiter)
    }

    fn rest_config(&self, testnet: bool) -> RestConfig {
        RestConfig {
            base_url: if testnet {
                self.testnet_url.clone()
            } else {
                self.base_url.clone()
            },
            api_key_header: API_KEY_HEADER,
            recv_window_ms: self.recv_window_ms,
            timeout: self.timeout,
            max_requests_per_sec: self.max_requests_per_sec,
        }
    }

    /// Unauthenticated adapter for market data only.
    pub fn public(&self) -> Result<BingXAdapter> {
        Ok(BingXAdapter::new(self.client(None)))
    }
}

impl ExchangeFactory for BingXFactory {
    fn name(&self) -> &str {
        "bingx"
    }

    fn connect(&self, credentials: Credentials, mode: TradingMode) -> Result<Arc<dyn ExchangeAdapter>> {
        if mode != TradingMode::Spot {
            return Err(Error::Config(format!("bingx spot adapter does not support {mode} mode")));
        }
        let testnet = credentials.is_testnet;
        let client = self.client(Some(credentials));
        info!(testnet, "Connected BingX adapter");
        Ok(Arc::new(BingXAdapter::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn factory_at(base_url: &str) -> BingXFactory {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.bingx_base_url = Url::parse(base_url).unwrap();
        BingXFactory::from_config(&config).unwrap()
    }

    fn factory() -> BingXFactory {
        // Nothing listens here; any network call fails with a connect error.
        factory_at("http://127.0.0.1:9")
    }

    /// Local server answering every request with `429 Retry-After: 60`.
    async fn rate_limited_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 429 Too Many Requests\r\nRetry-After: 60\r\n\
                          Content-Length: 0\r\nConnection: close\r\n\r\n",
                    )
                    .await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn adapters_of_one_account_share_the_cooldown() {
        let (url, hits) = rate_limited_server().await;
        let factory = factory_at(&url);
        let bot_a = factory.connect(Credentials::new("k", "s"), TradingMode::Spot).unwrap();
        let bot_b = factory.connect(Credentials::new("k", "s"), TradingMode::Spot).unwrap();

        assert!(bot_a.get_ticker("BTC/USDT").await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Refused locally while the account cools down.
        assert!(bot_a.get_ticker("BTC/USDT").await.is_none());
        assert!(bot_b.get_ticker("BTC/USDT").await.is_none());
        assert!(bot_b.get_all_balances().await.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A different account still has its own budget.
        let other = factory.connect(Credentials::new("k2", "s2"), TradingMode::Spot).unwrap();
        assert!(other.get_ticker("BTC/USDT").await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    fn request(quantity: f64) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            quantity,
            price: None,
            client_order_id: "bf1".into(),
        }
    }

    #[test]
    fn translates_symbols() {
        assert_eq!(BingXAdapter::exchange_symbol("btc/usdt").unwrap(), "BTC-USDT");
        assert!(matches!(
            BingXAdapter::exchange_symbol("BTCUSDT"),
            Err(ExchangeError::Unsupported(_))
        ));
        assert_eq!(bot_symbol("ETH-USDT"), "ETH/USDT");
    }

    #[tokio::test]
    async fn invalid_quantity_is_rejected_before_any_request() {
        let adapter = factory().connect(Credentials::new("k", "s"), TradingMode::Spot).unwrap();
        for quantity in [0.0, -1.0, f64::NAN] {
            let err = adapter.place_market_order(&request(quantity)).await.unwrap_err();
            assert!(matches!(err, ExchangeError::InvalidOrder(_)), "got {err:?}");
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_a_definite_failure() {
        let adapter = factory().connect(Credentials::new("k", "s"), TradingMode::Spot).unwrap();
        let err = adapter.place_market_order(&request(0.01)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unavailable(_)), "got {err:?}");
        assert!(adapter.get_ticker("BTC/USDT").await.is_none());
        assert!(adapter.get_all_balances().await.is_empty());
    }

    #[test]
    fn margin_mode_is_a_configuration_error() {
        let result = factory().connect(Credentials::new("k", "s"), TradingMode::Margin);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn order_result_keeps_bot_symbol_and_parses_status() {
        let order: BingXOrder = serde_json::from_value(json!({
            "symbol": "BTC-USDT",
            "orderId": "42",
            "clientOrderID": "bfabc",
            "price": "65000",
            "origQty": "0.01",
            "executedQty": "0",
            "status": "NEW",
            "side": "SELL"
        }))
        .unwrap();
        let result = BingXAdapter::order_result(order, "BTC/USDT", None).unwrap();
        assert_eq!(result.symbol, "BTC/USDT");
        assert_eq!(result.side, OrderSide::Sell);
        assert_eq!(result.price, Some(65000.0));
        assert_eq!(result.client_order_id.as_deref(), Some("bfabc"));
    }

    #[test]
    fn kline_rows_parse_from_mixed_values() {
        let row: BingXKline = serde_json::from_value(json!([
            1736000000000i64, "100.5", "101", "99.5", "100.8", "12.5", 1736003599999i64, "1260"
        ]))
        .unwrap();
        let candle = parse_kline(&row).unwrap();
        assert_eq!(candle.open, 100.5);
        assert_eq!(candle.close, 100.8);
        assert_eq!(candle.close_time.timestamp_millis(), 1736003599999);
        assert!(parse_kline(&vec![json!(1)]).is_none());
    }
}
