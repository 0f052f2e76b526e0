use async_trait::async_trait;

use common::{Credentials, Error, Result, SecretsProvider, TenantId};

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Credentials from environment variables, shared by every tenant:
/// `<EXCHANGE>_API_KEY`, `<EXCHANGE>_API_SECRET`, optional
/// `<EXCHANGE>_PASSPHRASE` and `<EXCHANGE>_TESTNET` (`true`/`1`).
pub struct EnvSecrets {
    lookup: Lookup,
}

impl EnvSecrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn var(&self, exchange: &str, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{}_{suffix}", exchange.to_uppercase()))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl SecretsProvider for EnvSecrets {
    async fn get_credentials(&self, tenant: TenantId, exchange: &str) -> Result<Credentials> {
        let missing = || Error::MissingCredentials {
            tenant: tenant.to_string(),
            exchange: exchange.to_string(),
        };
        let api_key = self.var(exchange, "API_KEY").ok_or_else(missing)?;
        let api_secret = self.var(exchange, "API_SECRET").ok_or_else(missing)?;

        let mut credentials = Credentials::new(api_key, api_secret);
        credentials.passphrase = self.var(exchange, "PASSPHRASE");
        credentials.is_testnet = self
            .var(exchange, "TESTNET")
            .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1");
        Ok(credentials)
    }
}
