//! In-memory exchange, factory and strategy for driving the scheduler.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use common::{
    Balance, BotDefinition, BotDirectory, BotId, Candle, CandleInterval, CandleQuery, Credentials,
    Error, ExchangeAdapter, ExchangeError, ExchangeFactory, OrderRef, OrderRequest, OrderResult,
    OrderSide, OrderStatus, Result, SymbolInfo, Ticker, TradingMode,
};
use engine::{Backoff, EngineHandle, ExchangeRegistry, Scheduler, SchedulerConfig};
use store::MemoryStore;
use strategy::{Decision, MarketSnapshot, SignalIntent, Strategy, StrategyError, StrategyRegistry};

/// How the mock answers order submissions.
#[derive(Debug, Clone)]
pub enum PlaceMode {
    Accept,
    /// Answer with an order in `Rejected` status.
    Reject,
    /// Fail without placing anything.
    Fail(ExchangeError),
    /// Place the order, then lose the response.
    AcceptThenLose,
}

/// Deterministic exchange. All state is in-memory and controllable from tests.
pub struct MockExchange {
    price: Mutex<Option<f64>>,
    mode: Mutex<PlaceMode>,
    orders: Mutex<HashMap<String, OrderResult>>,
    balances: Vec<Balance>,
    ticker_delay: Duration,
    place_delay: Duration,
    pub ticker_calls: AtomicUsize,
    pub place_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockExchange {
    pub fn new(price: Option<f64>) -> Self {
        Self {
            price: Mutex::new(price),
            mode: Mutex::new(PlaceMode::Accept),
            orders: Mutex::new(HashMap::new()),
            balances: Vec::new(),
            ticker_delay: Duration::ZERO,
            place_delay: Duration::ZERO,
            ticker_calls: AtomicUsize::new(0),
            place_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_ticker_delay(mut self, delay: Duration) -> Self {
        self.ticker_delay = delay;
        self
    }

    pub fn with_place_delay(mut self, delay: Duration) -> Self {
        self.place_delay = delay;
        self
    }

    pub fn with_balances(mut self, balances: Vec<Balance>) -> Self {
        self.balances = balances;
        self
    }

    pub fn set_mode(&self, mode: PlaceMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn placed(&self) -> usize {
        self.place_calls.load(Ordering::SeqCst)
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    fn result(order: &OrderRequest, status: OrderStatus) -> OrderResult {
        OrderResult {
            order_id: format!("mock-{}", Uuid::new_v4().simple()),
            client_order_id: Some(order.client_order_id.clone()),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: Some(100.0),
            status,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        if !self.place_delay.is_zero() {
            tokio::time::sleep(self.place_delay).await;
        }
        let mode = self.mode.lock().unwrap().clone();
        match mode {
            PlaceMode::Accept => {
                let result = Self::result(order, OrderStatus::Filled);
                self.orders
                    .lock()
                    .unwrap()
                    .insert(order.client_order_id.clone(), result.clone());
                Ok(result)
            }
            PlaceMode::Reject => Ok(Self::result(order, OrderStatus::Rejected)),
            PlaceMode::Fail(e) => Err(e),
            PlaceMode::AcceptThenLose => {
                let result = Self::result(order, OrderStatus::Filled);
                self.orders
                    .lock()
                    .unwrap()
                    .insert(order.client_order_id.clone(), result);
                Err(ExchangeError::Unknown("response lost".into()))
            }
        }
    }

    async fn place_limit_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        self.place_market_order(order).await
    }

    async fn cancel_order(&self, _symbol: &str, order: &OrderRef) -> Result<OrderResult, ExchangeError> {
        Err(ExchangeError::OrderNotFound(order.to_string()))
    }

    async fn get_order_status(&self, _symbol: &str, order: &OrderRef) -> Result<OrderResult, ExchangeError> {
        let orders = self.orders.lock().unwrap();
        let found = match order {
            OrderRef::Client(id) => orders.get(id).cloned(),
            OrderRef::Exchange(id) => orders.values().find(|o| &o.order_id == id).cloned(),
        };
        found.ok_or_else(|| ExchangeError::OrderNotFound(order.to_string()))
    }

    async fn get_balance(&self, asset: &str) -> Balance {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .cloned()
            .unwrap_or_else(|| Balance::empty(asset))
    }

    async fn get_all_balances(&self) -> Vec<Balance> {
        self.balances.clone()
    }

    async fn get_ticker(&self, symbol: &str) -> Option<Ticker> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.ticker_delay.is_zero() {
            tokio::time::sleep(self.ticker_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let price = (*self.price.lock().unwrap())?;
        Some(Ticker {
            symbol: symbol.to_string(),
            last_price: price,
            bid_price: price,
            ask_price: price,
            volume_24h: 0.0,
            timestamp: Utc::now(),
        })
    }

    async fn get_candles(&self, _symbol: &str, _interval: CandleInterval, _query: CandleQuery) -> Vec<Candle> {
        Vec::new()
    }

    async fn get_symbols(&self) -> Vec<SymbolInfo> {
        Vec::new()
    }
}

pub struct MockFactory {
    name: String,
    exchange: Arc<MockExchange>,
    requires_credentials: bool,
}

impl MockFactory {
    pub fn new(name: &str, exchange: Arc<MockExchange>) -> Self {
        Self {
            name: name.to_string(),
            exchange,
            requires_credentials: false,
        }
    }

    pub fn keyed(mut self) -> Self {
        self.requires_credentials = true;
        self
    }
}

impl ExchangeFactory for MockFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self, _credentials: Credentials, mode: TradingMode) -> Result<Arc<dyn ExchangeAdapter>> {
        if mode != TradingMode::Spot {
            return Err(Error::Config(format!("{} supports spot only", self.name)));
        }
        Ok(self.exchange.clone())
    }

    fn requires_credentials(&self) -> bool {
        self.requires_credentials
    }
}

/// Buys on every tick and counts its ticks in the state document.
pub struct AlwaysBuy;

impl AlwaysBuy {
    pub const NAME: &'static str = "always-buy";
}

impl Strategy for AlwaysBuy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn generate_signal(
        &self,
        market: &MarketSnapshot,
        _config: &Value,
        prior: &Value,
    ) -> Result<Decision, StrategyError> {
        let ticks = prior.get("ticks").and_then(Value::as_u64).unwrap_or(0);
        let price = market.ticker.as_ref().map(|t| t.last_price).unwrap_or_default();
        Ok(Decision::trade(
            SignalIntent {
                side: OrderSide::Buy,
                quantity: 0.5,
                price: None,
                reason: format!("tick {} at {price}", ticks + 1),
            },
            json!({ "ticks": ticks + 1 }),
        ))
    }
}

/// No backoff between failed ticks, short grace period.
pub fn fast_config(max_consecutive_failures: u32) -> SchedulerConfig {
    SchedulerConfig {
        max_consecutive_failures,
        backoff: Backoff::new(Duration::ZERO, Duration::ZERO),
        shutdown_grace: Duration::from_secs(1),
        tenant_id: None,
    }
}

pub fn registry(factories: Vec<MockFactory>) -> ExchangeRegistry {
    factories
        .into_iter()
        .fold(ExchangeRegistry::new(), |registry, factory| registry.register(factory))
}

pub fn scheduler(
    store: &Arc<MemoryStore>,
    factories: Vec<MockFactory>,
    config: SchedulerConfig,
) -> (Scheduler, EngineHandle) {
    Scheduler::new(
        store.clone(),
        store.clone(),
        registry(factories),
        StrategyRegistry::with_defaults().register(AlwaysBuy),
        config,
    )
}

pub async fn add_bot(store: &MemoryStore, exchange: &str, strategy: &str) -> BotId {
    let bot = BotDefinition::new(Uuid::nil(), format!("{strategy} on {exchange}"), exchange, "BTC/USDT", strategy);
    store.upsert_bot(&bot).await.unwrap();
    bot.id
}
