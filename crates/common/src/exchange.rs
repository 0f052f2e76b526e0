use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    Balance, Candle, CandleInterval, CandleQuery, Credentials, ExchangeError, OrderRef,
    OrderRequest, OrderResult, Result, SymbolInfo, Ticker, TradingMode,
};

/// Uniform capability set every exchange integration provides.
///
/// Symbols are passed in `BASE/QUOTE` notation; adapters translate to the
/// exchange's own format. Order calls validate their input before touching
/// the network and forward `OrderRequest::client_order_id` so that a
/// submission can later be found again with [`OrderRef::Client`].
///
/// Market-data and balance queries never fail: on error they log and return
/// an empty value, and the scheduler treats that as "skip this tick".
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Registry name, e.g. "bingx".
    fn name(&self) -> &str;

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn place_limit_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderResult, ExchangeError>;

    /// Current view of an order. `ExchangeError::OrderNotFound` means the
    /// exchange has no record of it.
    async fn get_order_status(&self, symbol: &str, order: &OrderRef) -> Result<OrderResult, ExchangeError>;

    /// Zero balance when the asset is unknown or the query fails.
    async fn get_balance(&self, asset: &str) -> Balance;

    async fn get_all_balances(&self) -> Vec<Balance>;

    async fn get_ticker(&self, symbol: &str) -> Option<Ticker>;

    async fn get_candles(&self, symbol: &str, interval: CandleInterval, query: CandleQuery) -> Vec<Candle>;

    async fn get_symbols(&self) -> Vec<SymbolInfo>;

    /// Dispatch on the presence of a limit price.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        match order.price {
            Some(_) => self.place_limit_order(order).await,
            None => self.place_market_order(order).await,
        }
    }
}

/// Builds an adapter bound to one account.
pub trait ExchangeFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with a configuration error when the account cannot be served,
    /// e.g. an unsupported trading mode.
    fn connect(&self, credentials: Credentials, mode: TradingMode) -> Result<Arc<dyn ExchangeAdapter>>;

    /// Whether `connect` needs real credentials. Simulated venues don't.
    fn requires_credentials(&self) -> bool {
        true
    }
}
