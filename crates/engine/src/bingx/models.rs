//! Wire types for the BingX spot API.
//!
//! BingX is inconsistent about number encoding, so numeric fields accept
//! either JSON strings or numbers.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use common::{ExchangeError, OrderStatus};

/// Error codes BingX uses for "no such order".
const ORDER_NOT_FOUND_CODES: [i64; 2] = [100404, 80016];

/// `{ code, msg, data }` envelope around every response.
#[derive(Debug, Deserialize)]
pub struct BingXResponse<T> {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

impl<T> BingXResponse<T> {
    /// `code != 0` is a rejection by the exchange.
    pub fn into_data(self) -> Result<T, ExchangeError> {
        if self.code != 0 {
            return Err(ExchangeError::Rejected {
                code: self.code,
                message: self.msg,
            });
        }
        self.data
            .ok_or_else(|| ExchangeError::Unknown(format!("response without data: {}", self.msg)))
    }

    /// Like [`into_data`](Self::into_data) but recognizes missing orders.
    pub fn into_order_data(self, reference: &str) -> Result<T, ExchangeError> {
        let lowered = self.msg.to_lowercase();
        if self.code != 0
            && (ORDER_NOT_FOUND_CODES.contains(&self.code)
                || lowered.contains("not exist")
                || lowered.contains("not found"))
        {
            return Err(ExchangeError::OrderNotFound(reference.to_string()));
        }
        self.into_data()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BingXOrder {
    pub symbol: String,
    #[serde(deserialize_with = "id_string")]
    pub order_id: String,
    #[serde(rename = "clientOrderID", alias = "clientOrderId", default)]
    pub client_order_id: Option<String>,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub orig_qty: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub executed_qty: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub cummulative_quote_qty: f64,
    pub status: String,
    pub side: String,
    #[serde(default, alias = "time", alias = "updateTime")]
    pub transact_time: Option<i64>,
}

impl BingXOrder {
    /// Average fill price when anything executed, else the order price.
    pub fn effective_price(&self) -> Option<f64> {
        if self.executed_qty > 0.0 && self.cummulative_quote_qty > 0.0 {
            Some(self.cummulative_quote_qty / self.executed_qty)
        } else if self.price > 0.0 {
            Some(self.price)
        } else {
            None
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.transact_time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now)
    }
}

pub fn parse_status(raw: &str) -> Result<OrderStatus, ExchangeError> {
    match raw.to_ascii_uppercase().as_str() {
        "NEW" | "PENDING" => Ok(OrderStatus::New),
        "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELED" | "CANCELLED" => Ok(OrderStatus::Canceled),
        "FAILED" | "REJECTED" => Ok(OrderStatus::Rejected),
        "EXPIRED" => Ok(OrderStatus::Expired),
        other => Err(ExchangeError::Unknown(format!("unrecognized order status '{other}'"))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BingXBalanceData {
    #[serde(default)]
    pub balances: Vec<BingXBalance>,
}

#[derive(Debug, Deserialize)]
pub struct BingXBalance {
    pub asset: String,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub free: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub locked: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BingXTicker {
    pub symbol: String,
    #[serde(deserialize_with = "flexible_f64")]
    pub last_price: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub bid_price: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub ask_price: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub volume: f64,
    #[serde(default)]
    pub close_time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BingXSymbolsData {
    #[serde(default)]
    pub symbols: Vec<BingXSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BingXSymbol {
    pub symbol: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub min_qty: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub max_qty: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub step_size: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub tick_size: f64,
    #[serde(default)]
    pub status: i64,
}

/// Kline rows: `[openTime, open, high, low, close, volume, closeTime, ...]`.
pub type BingXKline = Vec<Value>;

/// Accepts `"1.5"`, `1.5`, `""` and `null`; the latter two read as `0`.
pub fn flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_f64(&value).ok_or_else(|| serde::de::Error::custom(format!("not a number: {value}")))
}

pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse().ok(),
        Value::Null => Some(0.0),
        _ => None,
    }
}

pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Order ids arrive as large integers or strings.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid order id: {other}"))),
    }
}
