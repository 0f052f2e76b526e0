use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{
    Balance, Candle, CandleInterval, CandleQuery, Credentials, Error, ExchangeAdapter,
    ExchangeError, ExchangeFactory, OrderRef, OrderRequest, OrderResult, OrderSide, OrderStatus,
    Result, SymbolInfo, Ticker, TradingMode, TradingPair,
};

/// Exchange error code used for simulated insufficient-balance rejections.
const INSUFFICIENT_BALANCE: i64 = -2010;

/// Simulated exchange for paper trading.
///
/// Market data comes from an optional real adapter; orders fill locally at
/// the latest known price with configurable slippage against simulated
/// balances. Nothing is ever sent to a real exchange.
///
/// Orders are idempotent by client order id: resubmitting a known id
/// returns the original result.
pub struct PaperExchange {
    market: Option<Arc<dyn ExchangeAdapter>>,
    /// Latest known price per symbol.
    prices: RwLock<HashMap<String, f64>>,
    /// Free balance per asset.
    balances: RwLock<HashMap<String, f64>>,
    /// Every order by client order id.
    orders: RwLock<HashMap<String, OrderResult>>,
    /// Slippage in basis points applied to all fills.
    slippage_bps: f64,
    next_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(
        market: Option<Arc<dyn ExchangeAdapter>>,
        quote_asset: &str,
        initial_quote_balance: f64,
        slippage_bps: f64,
    ) -> Self {
        info!(
            quote = quote_asset,
            balance = initial_quote_balance,
            slippage_bps,
            "Paper exchange initialized"
        );
        let balances = HashMap::from([(quote_asset.to_uppercase(), initial_quote_balance)]);
        Self {
            market,
            prices: RwLock::new(HashMap::new()),
            balances: RwLock::new(balances),
            orders: RwLock::new(HashMap::new()),
            slippage_bps,
            next_id: AtomicU64::new(1),
        }
    }

    /// Set the latest price for a symbol. Used when no market source is attached.
    pub async fn update_price(&self, symbol: &str, price: f64) {
        self.prices.write().await.insert(symbol.to_uppercase(), price);
    }

    async fn last_price(&self, symbol: &str) -> Option<f64> {
        if let Some(ticker) = self.get_ticker(symbol).await {
            return Some(ticker.last_price);
        }
        self.prices.read().await.get(&symbol.to_uppercase()).copied()
    }

    fn pair(symbol: &str) -> Result<TradingPair, ExchangeError> {
        TradingPair::parse(symbol).map_err(|e| ExchangeError::Unsupported(e.to_string()))
    }

    /// Apply a fill to the simulated balances, or refuse it.
    async fn settle(&self, pair: &TradingPair, side: OrderSide, quantity: f64, price: f64) -> Result<(), ExchangeError> {
        let mut balances = self.balances.write().await;
        let notional = quantity * price;
        let (spend_asset, spend, receive_asset, receive) = match side {
            OrderSide::Buy => (&pair.quote, notional, &pair.base, quantity),
            OrderSide::Sell => (&pair.base, quantity, &pair.quote, notional),
        };
        let available = balances.get(spend_asset).copied().unwrap_or(0.0);
        if available + 1e-12 < spend {
            return Err(ExchangeError::Rejected {
                code: INSUFFICIENT_BALANCE,
                message: format!("insufficient {spend_asset}: need {spend}, have {available}"),
            });
        }
        *balances.entry(spend_asset.clone()).or_insert(0.0) -= spend;
        *balances.entry(receive_asset.clone()).or_insert(0.0) += receive;
        Ok(())
    }

    async fn place(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        order.validate()?;
        // Held until the order is stored so a duplicate can never settle twice.
        let mut orders = self.orders.write().await;
        if let Some(existing) = orders.get(&order.client_order_id) {
            debug!(client_order_id = %order.client_order_id, "Duplicate paper order; returning original");
            return Ok(existing.clone());
        }
        let pair = Self::pair(&order.symbol)?;
        let last = self
            .last_price(&order.symbol)
            .await
            .ok_or_else(|| ExchangeError::Unavailable(format!("no price for {}", order.symbol)))?;

        // Limit orders fill only when marketable; otherwise they rest as New.
        let fill_price = match order.price {
            None => Some(match order.side {
                OrderSide::Buy => last * (1.0 + self.slippage_bps / 10_000.0),
                OrderSide::Sell => last * (1.0 - self.slippage_bps / 10_000.0),
            }),
            Some(limit) => match order.side {
                OrderSide::Buy if limit >= last => Some(limit.min(last)),
                OrderSide::Sell if limit <= last => Some(limit.max(last)),
                _ => None,
            },
        };

        let status = match fill_price {
            Some(price) => {
                self.settle(&pair, order.side, order.quantity, price).await?;
                OrderStatus::Filled
            }
            None => OrderStatus::New,
        };

        let result = OrderResult {
            order_id: format!("paper-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            client_order_id: Some(order.client_order_id.clone()),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: fill_price.or(order.price),
            status,
            timestamp: Utc::now(),
        };
        debug!(
            symbol = %order.symbol,
            side = %order.side,
            last,
            fill = ?fill_price,
            qty = order.quantity,
            status = %status,
            "Paper order simulated"
        );

        orders.insert(order.client_order_id.clone(), result.clone());
        Ok(result)
    }

    async fn find(&self, order: &OrderRef) -> Option<OrderResult> {
        let orders = self.orders.read().await;
        match order {
            OrderRef::Client(id) => orders.get(id).cloned(),
            OrderRef::Exchange(id) => orders.values().find(|o| &o.order_id == id).cloned(),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        if order.price.is_some() {
            return Err(ExchangeError::InvalidOrder("market order with a price".into()));
        }
        self.place(order).await
    }

    async fn place_limit_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        if order.price.is_none() {
            return Err(ExchangeError::InvalidOrder("limit order without a price".into()));
        }
        self.place(order).await
    }

    async fn cancel_order(&self, _symbol: &str, order: &OrderRef) -> Result<OrderResult, ExchangeError> {
        let found = self
            .find(order)
            .await
            .ok_or_else(|| ExchangeError::OrderNotFound(order.to_string()))?;
        if found.status.is_terminal() {
            return Err(ExchangeError::Rejected {
                code: -2011,
                message: format!("order {} is already {}", found.order_id, found.status),
            });
        }
        let key = found.client_order_id.clone().unwrap_or_default();
        let mut orders = self.orders.write().await;
        let stored = orders
            .get_mut(&key)
            .ok_or_else(|| ExchangeError::OrderNotFound(order.to_string()))?;
        stored.status = OrderStatus::Canceled;
        stored.timestamp = Utc::now();
        Ok(stored.clone())
    }

    async fn get_order_status(&self, _symbol: &str, order: &OrderRef) -> Result<OrderResult, ExchangeError> {
        self.find(order)
            .await
            .ok_or_else(|| ExchangeError::OrderNotFound(order.to_string()))
    }

    async fn get_balance(&self, asset: &str) -> Balance {
        let free = self.balances.read().await.get(&asset.to_uppercase()).copied();
        match free {
            Some(free) => Balance {
                asset: asset.to_uppercase(),
                total: free,
                available: free,
                locked: 0.0,
            },
            None => Balance::empty(asset),
        }
    }

    async fn get_all_balances(&self) -> Vec<Balance> {
        let mut balances: Vec<Balance> = self
            .balances
            .read()
            .await
            .iter()
            .filter(|(_, free)| **free > 0.0)
            .map(|(asset, free)| Balance {
                asset: asset.clone(),
                total: *free,
                available: *free,
                locked: 0.0,
            })
            .collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        balances
    }

    async fn get_ticker(&self, symbol: &str) -> Option<Ticker> {
        if let Some(market) = &self.market {
            let ticker = market.get_ticker(symbol).await?;
            self.update_price(symbol, ticker.last_price).await;
            return Some(ticker);
        }
        let price = self.prices.read().await.get(&symbol.to_uppercase()).copied()?;
        Some(Ticker {
            symbol: symbol.to_string(),
            last_price: price,
            bid_price: price,
            ask_price: price,
            volume_24h: 0.0,
            timestamp: Utc::now(),
        })
    }

    async fn get_candles(&self, symbol: &str, interval: CandleInterval, query: CandleQuery) -> Vec<Candle> {
        match &self.market {
            Some(market) => market.get_candles(symbol, interval, query).await,
            None => Vec::new(),
        }
    }

    async fn get_symbols(&self) -> Vec<SymbolInfo> {
        match &self.market {
            Some(market) => market.get_symbols().await,
            None => Vec::new(),
        }
    }
}

/// Registers the paper venue. Every connection shares one simulated
/// exchange, so order idempotency survives reconnects.
pub struct PaperFactory {
    exchange: Arc<PaperExchange>,
}

impl PaperFactory {
    pub fn new(exchange: PaperExchange) -> Self {
        Self {
            exchange: Arc::new(exchange),
        }
    }

    pub fn exchange(&self) -> Arc<PaperExchange> {
        self.exchange.clone()
    }
}

impl ExchangeFactory for PaperFactory {
    fn name(&self) -> &str {
        "paper"
    }

    fn connect(&self, _credentials: Credentials, mode: TradingMode) -> Result<Arc<dyn ExchangeAdapter>> {
        if mode != TradingMode::Spot {
            return Err(Error::Config("paper exchange simulates spot only".into()));
        }
        Ok(self.exchange.clone())
    }

    fn requires_credentials(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(side: OrderSide, quantity: f64, client_id: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".into(),
            side,
            quantity,
            price: None,
            client_order_id: client_id.into(),
        }
    }

    async fn exchange(slippage_bps: f64) -> PaperExchange {
        let ex = PaperExchange::new(None, "USDT", 10_000.0, slippage_bps);
        ex.update_price("BTC/USDT", 1000.0).await;
        ex
    }

    #[tokio::test]
    async fn buy_fill_applies_positive_slippage() {
        let ex = exchange(10.0).await;
        let fill = ex.place_market_order(&market(OrderSide::Buy, 0.01, "bf1")).await.unwrap();
        let expected = 1000.0 * (1.0 + 10.0 / 10_000.0);
        assert_eq!(fill.status, OrderStatus::Filled);
        assert!((fill.price.unwrap() - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sell_fill_applies_negative_slippage() {
        let ex = exchange(10.0).await;
        ex.place_market_order(&market(OrderSide::Buy, 0.01, "bf1")).await.unwrap();
        let fill = ex.place_market_order(&market(OrderSide::Sell, 0.01, "bf2")).await.unwrap();
        let expected = 1000.0 * (1.0 - 10.0 / 10_000.0);
        assert!((fill.price.unwrap() - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn balances_follow_fills() {
        let ex = exchange(0.0).await;
        ex.place_market_order(&market(OrderSide::Buy, 2.0, "bf1")).await.unwrap();
        assert_eq!(ex.get_balance("BTC").await.total, 2.0);
        assert_eq!(ex.get_balance("usdt").await.available, 8_000.0);
        assert_eq!(ex.get_all_balances().await.len(), 2);
    }

    #[tokio::test]
    async fn resubmitting_client_id_returns_original_order() {
        let ex = exchange(0.0).await;
        let first = ex.place_market_order(&market(OrderSide::Buy, 1.0, "bf-same")).await.unwrap();
        ex.update_price("BTC/USDT", 2000.0).await;
        let again = ex.place_market_order(&market(OrderSide::Buy, 1.0, "bf-same")).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(ex.get_balance("BTC").await.total, 1.0);

        let status = ex
            .get_order_status("BTC/USDT", &OrderRef::Client("bf-same".into()))
            .await
            .unwrap();
        assert_eq!(status.order_id, first.order_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_settle_once() {
        let ex = Arc::new(exchange(0.0).await);
        let submits: Vec<_> = (0..8)
            .map(|_| {
                let ex = ex.clone();
                tokio::spawn(async move {
                    ex.place_market_order(&market(OrderSide::Buy, 1.0, "bf-race"))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut results = Vec::new();
        for submit in submits {
            results.push(submit.await.unwrap());
        }
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(ex.get_balance("BTC").await.total, 1.0);
        assert_eq!(ex.get_balance("USDT").await.total, 9_000.0);
    }

    #[tokio::test]
    async fn insufficient_balance_is_rejected() {
        let ex = exchange(0.0).await;
        let err = ex
            .place_market_order(&market(OrderSide::Buy, 100.0, "bf1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: INSUFFICIENT_BALANCE, .. }));
        let err = ex
            .place_market_order(&market(OrderSide::Sell, 1.0, "bf2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { .. }));
    }

    #[tokio::test]
    async fn resting_limit_order_can_be_canceled() {
        let ex = exchange(0.0).await;
        let mut order = market(OrderSide::Buy, 1.0, "bf-limit");
        order.price = Some(900.0);
        let placed = ex.place_limit_order(&order).await.unwrap();
        assert_eq!(placed.status, OrderStatus::New);

        let canceled = ex
            .cancel_order("BTC/USDT", &OrderRef::Exchange(placed.order_id.clone()))
            .await
            .unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert!(ex
            .cancel_order("BTC/USDT", &OrderRef::Client("bf-limit".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let ex = exchange(0.0).await;
        let err = ex
            .get_order_status("BTC/USDT", &OrderRef::Client("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn no_price_means_unavailable() {
        let ex = PaperExchange::new(None, "USDT", 100.0, 0.0);
        let err = ex
            .place_market_order(&market(OrderSide::Buy, 0.01, "bf1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Unavailable(_)));
        assert!(ex.get_ticker("BTC/USDT").await.is_none());
    }

    #[test]
    fn factory_needs_no_credentials() {
        let factory = PaperFactory::new(PaperExchange::new(None, "USDT", 0.0, 0.0));
        assert!(!factory.requires_credentials());
        assert!(factory.connect(Credentials::new("", ""), TradingMode::Spot).is_ok());
        assert!(matches!(
            factory.connect(Credentials::new("", ""), TradingMode::Margin),
            Err(Error::Config(_))
        ));
    }
}
