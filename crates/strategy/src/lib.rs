pub mod config;
pub mod indicators;
pub mod martingale;
pub mod registry;
pub mod rsi;

pub use config::Params;
pub use martingale::MartingaleStrategy;
pub use registry::StrategyRegistry;
pub use rsi::RsiStrategy;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;

use common::{Candle, CandleInterval, OrderSide, Ticker};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    #[error("invalid strategy config: {0}")]
    InvalidConfig(String),

    #[error("unreadable strategy state: {0}")]
    InvalidState(String),
}

/// Market data gathered by the scheduler before a strategy runs.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub ticker: Option<Ticker>,
    /// Oldest first. Empty unless the strategy asked for candles.
    pub candles: Vec<Candle>,
    /// Reference time for staleness checks.
    pub observed_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// The ticker, if present and no older than `max_age`.
    pub fn fresh_ticker(&self, max_age: Duration) -> Option<&Ticker> {
        self.ticker
            .as_ref()
            .filter(|t| self.observed_at.signed_duration_since(t.timestamp) <= max_age)
    }

    /// Candles whose close time is not after the observation time.
    pub fn closed_candles(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter().filter(|c| c.close_time <= self.observed_at)
    }
}

/// Candles a strategy needs in its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleRequirement {
    pub interval: CandleInterval,
    pub count: u32,
}

/// What a strategy wants traded. The scheduler turns it into a `Signal`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalIntent {
    pub side: OrderSide,
    pub quantity: f64,
    /// `None` = market order.
    pub price: Option<f64>,
    pub reason: String,
}

/// Outcome of one evaluation: an optional trade and the next state document.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub signal: Option<SignalIntent>,
    pub state: Value,
}

impl Decision {
    pub fn hold(state: Value) -> Self {
        Self { signal: None, state }
    }

    pub fn trade(signal: SignalIntent, state: Value) -> Self {
        Self {
            signal: Some(signal),
            state,
        }
    }
}

/// All strategy implementations must satisfy this trait.
///
/// Implementations are shared between bots and hold no per-bot data: all
/// mutable state travels in the `prior` document and comes back in
/// `Decision::state`. `generate_signal` must be deterministic and must not
/// block or perform I/O.
pub trait Strategy: Send + Sync {
    /// Registry key, e.g. "martingale".
    fn name(&self) -> &str;

    /// Candles to fetch before evaluation. Default: none.
    fn candle_requirement(&self, _config: &Value) -> Result<Option<CandleRequirement>, StrategyError> {
        Ok(None)
    }

    /// Evaluate one tick. A `Null` prior means the bot has never run.
    fn generate_signal(
        &self,
        market: &MarketSnapshot,
        config: &Value,
        prior: &Value,
    ) -> Result<Decision, StrategyError>;
}
