use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::StrategyError;

/// Typed reads from a bot's opaque configuration blob.
///
/// Missing keys fall back to the supplied default; present keys of the wrong
/// type are an error rather than being silently replaced.
///
/// ```
/// use strategy::Params;
/// let cfg = serde_json::json!({ "baseQuantity": 0.01, "maxLevels": 4 });
/// let params = Params::new(&cfg);
/// assert_eq!(params.f64("baseQuantity", 1.0).unwrap(), 0.01);
/// assert_eq!(params.u32("maxLevels", 5).unwrap(), 4);
/// assert_eq!(params.f64("multiplier", 2.0).unwrap(), 2.0);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    value: &'a Value,
}

impl<'a> Params<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self { value }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.value.get(key).filter(|v| !v.is_null())
    }

    pub fn f64(&self, key: &str, default: f64) -> Result<f64, StrategyError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_f64()
                .filter(|x| x.is_finite())
                .ok_or_else(|| invalid(key, "a number", v)),
        }
    }

    pub fn u32(&self, key: &str, default: u32) -> Result<u32, StrategyError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .and_then(|x| u32::try_from(x).ok())
                .ok_or_else(|| invalid(key, "a non-negative integer", v)),
        }
    }

    pub fn string(&self, key: &str, default: &str) -> Result<String, StrategyError> {
        match self.get(key) {
            None => Ok(default.to_string()),
            Some(v) => v
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(key, "a string", v)),
        }
    }
}

fn invalid(key: &str, expected: &str, got: &Value) -> StrategyError {
    StrategyError::InvalidConfig(format!("'{key}' must be {expected}, got {got}"))
}

/// Read a strategy's typed state; `Null` means first run.
pub fn load_state<T>(prior: &Value) -> Result<T, StrategyError>
where
    T: DeserializeOwned + Default,
{
    if prior.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(prior.clone()).map_err(|e| StrategyError::InvalidState(e.to_string()))
}

pub fn store_state<T: Serialize>(state: &T) -> Result<Value, StrategyError> {
    serde_json::to_value(state).map_err(|e| StrategyError::InvalidState(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn wrong_types_are_rejected() {
        let cfg = json!({ "multiplier": "two", "maxLevels": -1, "interval": 5 });
        let params = Params::new(&cfg);
        assert!(params.f64("multiplier", 2.0).is_err());
        assert!(params.u32("maxLevels", 5).is_err());
        assert!(params.string("interval", "1h").is_err());
    }

    #[test]
    fn null_and_missing_fall_back_to_defaults() {
        let cfg = json!({ "multiplier": null });
        let params = Params::new(&cfg);
        assert_eq!(params.f64("multiplier", 2.0).unwrap(), 2.0);
        assert_eq!(params.string("interval", "1h").unwrap(), "1h");

        let not_an_object = Value::Null;
        assert_eq!(Params::new(&not_an_object).u32("period", 14).unwrap(), 14);
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        n: u32,
    }

    #[test]
    fn state_round_trip_and_first_run() {
        let fresh: Counter = load_state(&Value::Null).unwrap();
        assert_eq!(fresh, Counter::default());

        let stored = store_state(&Counter { n: 3 }).unwrap();
        let loaded: Counter = load_state(&stored).unwrap();
        assert_eq!(loaded.n, 3);

        let garbage = json!({ "n": "three" });
        assert!(load_state::<Counter>(&garbage).is_err());
    }
}
