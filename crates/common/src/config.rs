use std::str::FromStr;
use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::{Error, Result, TenantId};

/// All configuration loaded from environment variables at startup.
/// Every setting has a default; malformed values are a configuration error.
#[derive(Debug, Clone)]
pub struct Config {
    // Scheduler
    pub tick_interval: Duration,
    pub max_consecutive_failures: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub shutdown_grace: Duration,
    /// Restrict this worker to one tenant's bots.
    pub tenant_id: Option<TenantId>,

    // Storage
    /// `None` = in-memory store.
    pub database_url: Option<String>,
    pub bots_file: String,

    // Exchange HTTP
    pub bingx_base_url: Url,
    pub recv_window_ms: u64,
    pub http_timeout: Duration,
    pub max_requests_per_sec: u32,

    // Balance poller, disabled when zero
    pub balance_poll_interval: Duration,

    // Paper trading
    pub paper_slippage_bps: f64,
    pub paper_start_balance: f64,
}

impl Config {
    /// Load configuration from the process environment.
    /// Loads `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Used by `from_env` and by tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let bingx_base_url = env
            .string("BINGX_BASE_URL")
            .unwrap_or_else(|| "https://open-api.bingx.com".to_string());
        let bingx_base_url = Url::parse(&bingx_base_url)
            .map_err(|e| Error::Config(format!("BINGX_BASE_URL '{bingx_base_url}': {e}")))?;

        let tenant_id = match env.string("TENANT_ID") {
            Some(raw) => Some(
                Uuid::parse_str(&raw)
                    .map_err(|e| Error::Config(format!("TENANT_ID '{raw}': {e}")))?,
            ),
            None => None,
        };

        let config = Config {
            tick_interval: Duration::from_secs(env.parse("TICK_INTERVAL_SECS", 60)?),
            max_consecutive_failures: env.parse("MAX_CONSECUTIVE_FAILURES", 5)?,
            backoff_base: Duration::from_secs(env.parse("BACKOFF_BASE_SECS", 5)?),
            backoff_max: Duration::from_secs(env.parse("BACKOFF_MAX_SECS", 300)?),
            shutdown_grace: Duration::from_secs(env.parse("SHUTDOWN_GRACE_SECS", 10)?),
            tenant_id,
            database_url: env.string("DATABASE_URL"),
            bots_file: env
                .string("BOTS_FILE")
                .unwrap_or_else(|| "config/bots.toml".to_string()),
            bingx_base_url,
            recv_window_ms: env.parse("BINGX_RECV_WINDOW", 5000)?,
            http_timeout: Duration::from_secs(env.parse("HTTP_TIMEOUT_SECS", 10)?),
            max_requests_per_sec: env.parse("MAX_REQUESTS_PER_SEC", 10)?,
            balance_poll_interval: Duration::from_secs(env.parse("BALANCE_POLL_INTERVAL_SECS", 0)?),
            paper_slippage_bps: env.parse("PAPER_SLIPPAGE_BPS", 10.0)?,
            paper_start_balance: env.parse("PAPER_START_BALANCE", 10_000.0)?,
        };

        if config.tick_interval.is_zero() {
            return Err(Error::Config("TICK_INTERVAL_SECS must be positive".into()));
        }
        if config.max_consecutive_failures == 0 {
            return Err(Error::Config("MAX_CONSECUTIVE_FAILURES must be positive".into()));
        }
        if config.backoff_max < config.backoff_base {
            return Err(Error::Config(
                "BACKOFF_MAX_SECS must not be below BACKOFF_BASE_SECS".into(),
            ));
        }

        Ok(config)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("{key}='{raw}': {e}"))),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.tick_interval, Duration::from_secs(60));
        assert_eq!(cfg.max_consecutive_failures, 5);
        assert_eq!(cfg.recv_window_ms, 5000);
        assert_eq!(cfg.bingx_base_url.as_str(), "https://open-api.bingx.com/");
        assert!(cfg.database_url.is_none());
        assert!(cfg.tenant_id.is_none());
        assert!(cfg.balance_poll_interval.is_zero());
    }

    #[test]
    fn values_are_parsed() {
        let tenant = Uuid::new_v4().to_string();
        let cfg = config_from(&[
            ("TICK_INTERVAL_SECS", "15"),
            ("MAX_CONSECUTIVE_FAILURES", "3"),
            ("TENANT_ID", tenant.as_str()),
            ("DATABASE_URL", "sqlite://bots.db"),
            ("PAPER_SLIPPAGE_BPS", "2.5"),
        ])
        .unwrap();
        assert_eq!(cfg.tick_interval, Duration::from_secs(15));
        assert_eq!(cfg.max_consecutive_failures, 3);
        assert_eq!(cfg.tenant_id.unwrap().to_string(), tenant);
        assert_eq!(cfg.database_url.as_deref(), Some("sqlite://bots.db"));
        assert!((cfg.paper_slippage_bps - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_values_are_config_errors() {
        assert!(matches!(
            config_from(&[("TICK_INTERVAL_SECS", "soon")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config_from(&[("TENANT_ID", "not-a-uuid")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config_from(&[("BINGX_BASE_URL", "::nope")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config_from(&[("TICK_INTERVAL_SECS", "0")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config_from(&[("BACKOFF_BASE_SECS", "10"), ("BACKOFF_MAX_SECS", "5")]),
            Err(Error::Config(_))
        ));
    }
}
