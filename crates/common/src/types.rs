use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, ExchangeError, Result};

pub type BotId = Uuid;
pub type TenantId = Uuid;

/// Side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Lifecycle of an order as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_rejected(self) -> bool {
        self == OrderStatus::Rejected
    }

    /// No further fills can happen once an order is in a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::New => "new",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Spot or margin account the bot trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Spot,
    Margin,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Spot => write!(f, "spot"),
            TradingMode::Margin => write!(f, "margin"),
        }
    }
}

/// Per-bot lifecycle as seen by the scheduler.
///
/// `Suspended` is entered by the engine (circuit breaker or configuration
/// error) and only left by an operator reactivation. `Stopped` is entered by
/// an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum BotStatus {
    #[default]
    Idle,
    Running,
    Suspended,
    Stopped,
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotStatus::Idle => write!(f, "idle"),
            BotStatus::Running => write!(f, "running"),
            BotStatus::Suspended => write!(f, "suspended"),
            BotStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// A configured trading bot: one account, one symbol, one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotDefinition {
    pub id: BotId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Registry key of the exchange adapter, e.g. "bingx".
    pub exchange: String,
    /// `BASE/QUOTE` notation, e.g. "BTC/USDT".
    pub symbol: String,
    /// Registry key of the strategy, e.g. "martingale".
    pub strategy: String,
    pub mode: TradingMode,
    /// Strategy-specific parameters. Never interpreted by the scheduler.
    pub config: serde_json::Value,
    pub is_active: bool,
    pub status: BotStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BotDefinition {
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            exchange: exchange.into(),
            symbol: symbol.into(),
            strategy: strategy.into(),
            mode: TradingMode::Spot,
            config: serde_json::Value::Object(Default::default()),
            is_active: true,
            status: BotStatus::Idle,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Eligible for scheduling: switched on and not parked by the engine or an operator.
    pub fn is_schedulable(&self) -> bool {
        self.is_active && !matches!(self.status, BotStatus::Suspended | BotStatus::Stopped)
    }
}

/// An order whose outcome the scheduler has not confirmed yet.
///
/// Written before the order is sent so that a tick interrupted mid-flight
/// can be reconciled by a status query instead of a resubmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub signal_id: Uuid,
    pub request: OrderRequest,
    /// Strategy document to commit once the order is confirmed.
    pub proposed: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

/// Snapshot of a bot's mutable state. The latest snapshot by timestamp wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    pub bot_id: BotId,
    /// Owned by the bot's strategy.
    pub document: serde_json::Value,
    #[serde(default)]
    pub pending: Option<PendingOrder>,
    pub timestamp: DateTime<Utc>,
}

impl BotState {
    pub fn initial(bot_id: BotId) -> Self {
        Self {
            bot_id,
            document: serde_json::Value::Null,
            pending: None,
            timestamp: Utc::now(),
        }
    }

    pub fn next(&self, document: serde_json::Value, pending: Option<PendingOrder>) -> Self {
        Self {
            bot_id: self.bot_id,
            document,
            pending,
            timestamp: Utc::now(),
        }
    }
}

/// An intent to trade, recorded whether or not it was executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub bot_id: BotId,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    /// `None` = market order.
    pub price: Option<f64>,
    pub reason: String,
    pub is_executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        bot_id: BotId,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        price: Option<f64>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bot_id,
            symbol: symbol.into(),
            side,
            quantity,
            price,
            reason: reason.into(),
            is_executed: false,
            executed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Client order id sent to the exchange for this signal.
    /// Stable for the signal's lifetime and at most 34 characters.
    pub fn client_order_id(&self) -> String {
        format!("bf{}", self.id.simple())
    }

    pub fn order_request(&self) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            side: self.side,
            quantity: self.quantity,
            price: self.price,
            client_order_id: self.client_order_id(),
        }
    }

    /// Flip the execution flag. Allowed once, and only for an accepted order.
    pub fn mark_executed(&mut self, result: &OrderResult) -> Result<()> {
        if self.is_executed {
            return Err(Error::InvalidState(format!(
                "signal {} already executed",
                self.id
            )));
        }
        if result.status.is_rejected() {
            return Err(Error::InvalidState(format!(
                "signal {} cannot be executed by rejected order {}",
                self.id, result.order_id
            )));
        }
        self.is_executed = true;
        self.executed_at = Some(result.timestamp);
        Ok(())
    }
}

/// Parameters of a single order submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    /// `None` = market order; `Some(price)` = limit order.
    pub price: Option<f64>,
    pub client_order_id: String,
}

impl OrderRequest {
    /// Local sanity check run by every adapter before touching the network.
    pub fn validate(&self) -> Result<(), ExchangeError> {
        if !(self.quantity.is_finite() && self.quantity > 0.0) {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if let Some(price) = self.price {
            if !(price.is_finite() && price > 0.0) {
                return Err(ExchangeError::InvalidOrder(format!(
                    "price must be positive, got {price}"
                )));
            }
        }
        if self.client_order_id.is_empty() {
            return Err(ExchangeError::InvalidOrder("missing client order id".into()));
        }
        Ok(())
    }
}

/// Identifies an existing order either by the exchange's id or by ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    Exchange(String),
    Client(String),
}

impl std::fmt::Display for OrderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderRef::Exchange(id) => write!(f, "order {id}"),
            OrderRef::Client(id) => write!(f, "client order {id}"),
        }
    }
}

/// The exchange's acknowledgement of an order. Never mutated; a later status
/// query produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub total: f64,
    pub available: f64,
    pub locked: f64,
}

impl Balance {
    pub fn empty(asset: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            total: 0.0,
            available: 0.0,
            locked: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub volume_24h: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "15m")]
    Minutes15,
    #[serde(rename = "30m")]
    Minutes30,
    #[default]
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hours4,
    #[serde(rename = "1d")]
    Day1,
}

impl CandleInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            CandleInterval::Minutes15 => "15m",
            CandleInterval::Minutes30 => "30m",
            CandleInterval::Hour1 => "1h",
            CandleInterval::Hours4 => "4h",
            CandleInterval::Day1 => "1d",
        }
    }

    pub fn minutes(self) -> u32 {
        match self {
            CandleInterval::Minutes15 => 15,
            CandleInterval::Minutes30 => 30,
            CandleInterval::Hour1 => 60,
            CandleInterval::Hours4 => 240,
            CandleInterval::Day1 => 1440,
        }
    }
}

impl std::str::FromStr for CandleInterval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "15m" => Ok(CandleInterval::Minutes15),
            "30m" => Ok(CandleInterval::Minutes30),
            "1h" => Ok(CandleInterval::Hour1),
            "4h" => Ok(CandleInterval::Hours4),
            "1d" => Ok(CandleInterval::Day1),
            other => Err(Error::Config(format!("unsupported candle interval '{other}'"))),
        }
    }
}

/// Time window for a candle query. All fields optional; the exchange
/// applies its own defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CandleQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Exchange metadata about a tradable symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub min_quantity: f64,
    pub max_quantity: f64,
    pub quantity_step: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub price_step: f64,
    pub is_active: bool,
}

/// `BASE/QUOTE` pair as written in bot definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn parse(symbol: &str) -> Result<Self> {
        match symbol.split('/').collect::<Vec<_>>().as_slice() {
            [base, quote] if !base.trim().is_empty() && !quote.trim().is_empty() => Ok(Self {
                base: base.trim().to_uppercase(),
                quote: quote.trim().to_uppercase(),
            }),
            _ => Err(Error::Config(format!(
                "invalid symbol format '{symbol}', expected BASE/QUOTE"
            ))),
        }
    }

    /// Render with an exchange-specific separator, e.g. `-` for `BTC-USDT`.
    pub fn joined(&self, separator: &str) -> String {
        format!("{}{separator}{}", self.base, self.quote)
    }
}

impl std::fmt::Display for TradingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// API credentials for one tenant's exchange account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
    pub is_testnet: bool,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: None,
            is_testnet: false,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("is_testnet", &self.is_testnet)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(status: OrderStatus) -> OrderResult {
        OrderResult {
            order_id: "42".into(),
            client_order_id: None,
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            quantity: 1.0,
            price: Some(100.0),
            status,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn signal_executes_once() {
        let mut signal = Signal::new(Uuid::new_v4(), "BTC/USDT", OrderSide::Buy, 1.0, None, "test");
        signal.mark_executed(&accepted(OrderStatus::Filled)).unwrap();
        assert!(signal.is_executed);
        assert!(signal.executed_at.is_some());
        assert!(signal.mark_executed(&accepted(OrderStatus::Filled)).is_err());
    }

    #[test]
    fn signal_not_executed_by_rejected_order() {
        let mut signal = Signal::new(Uuid::new_v4(), "BTC/USDT", OrderSide::Sell, 1.0, None, "test");
        assert!(signal.mark_executed(&accepted(OrderStatus::Rejected)).is_err());
        assert!(!signal.is_executed);
        assert!(signal.executed_at.is_none());
    }

    #[test]
    fn client_order_id_is_stable_and_short() {
        let signal = Signal::new(Uuid::new_v4(), "ETH/USDT", OrderSide::Buy, 0.5, None, "test");
        assert_eq!(signal.client_order_id(), signal.client_order_id());
        assert_eq!(signal.client_order_id().len(), 34);
        assert_eq!(signal.order_request().client_order_id, signal.client_order_id());
    }

    #[test]
    fn order_request_rejects_non_positive_values() {
        let mut req = OrderRequest {
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            quantity: 0.0,
            price: None,
            client_order_id: "abc".into(),
        };
        assert!(matches!(req.validate(), Err(ExchangeError::InvalidOrder(_))));

        req.quantity = -1.0;
        assert!(req.validate().is_err());

        req.quantity = f64::NAN;
        assert!(req.validate().is_err());

        req.quantity = 1.0;
        req.price = Some(0.0);
        assert!(req.validate().is_err());

        req.price = Some(10.0);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn trading_pair_parses_and_joins() {
        let pair = TradingPair::parse("btc/usdt").unwrap();
        assert_eq!(pair.base, "BTC");
        assert_eq!(pair.joined("-"), "BTC-USDT");
        assert_eq!(pair.to_string(), "BTC/USDT");
        assert!(TradingPair::parse("BTCUSDT").is_err());
        assert!(TradingPair::parse("BTC/").is_err());
        assert!(TradingPair::parse("A/B/C").is_err());
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let mut creds = Credentials::new("key", "very-secret");
        creds.passphrase = Some("phrase".into());
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("\"phrase\""));
        assert!(rendered.contains("key"));
    }

    #[test]
    fn bot_schedulable_only_when_active_and_not_parked() {
        let mut bot = BotDefinition::new(Uuid::new_v4(), "b", "bingx", "BTC/USDT", "martingale");
        assert!(bot.is_schedulable());
        bot.status = BotStatus::Suspended;
        assert!(!bot.is_schedulable());
        bot.status = BotStatus::Running;
        bot.is_active = false;
        assert!(!bot.is_schedulable());
    }

    #[test]
    fn candle_interval_round_trips_through_str() {
        for interval in [
            CandleInterval::Minutes15,
            CandleInterval::Minutes30,
            CandleInterval::Hour1,
            CandleInterval::Hours4,
            CandleInterval::Day1,
        ] {
            assert_eq!(interval.as_str().parse::<CandleInterval>().unwrap(), interval);
        }
        assert!("2h".parse::<CandleInterval>().is_err());
    }
}
