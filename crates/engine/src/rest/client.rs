use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use common::Credentials;

use super::limiter::RateLimiter;
use super::signing::{canonical_query, signed_query};
use super::{RestError, RestErrorKind};

/// Cooldown applied when a 429/418 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Connection settings for one exchange host.
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: Url,
    /// Header carrying the api key on every request.
    pub api_key_header: &'static str,
    pub recv_window_ms: u64,
    pub timeout: Duration,
    pub max_requests_per_sec: u32,
}

/// HTTP client that signs requests with one account's credentials.
///
/// Signed calls get `timestamp`, `recvWindow` and a trailing `signature`.
/// No retries happen here; callers decide.
pub struct SignedClient {
    http: Client,
    config: RestConfig,
    credentials: Option<Credentials>,
    limiter: Arc<RateLimiter>,
}

impl SignedClient {
    /// `credentials` may be `None` for market-data-only use; signed calls
    /// then fail with a `Request` error.
    pub fn new(config: RestConfig, credentials: Option<Credentials>) -> Result<Self, RestError> {
        let http = Self::http_client(config.timeout)?;
        let limiter = Arc::new(RateLimiter::per_second(config.max_requests_per_sec));
        Ok(Self::with_shared(config, credentials, http, limiter))
    }

    /// Build on a connection pool and limiter shared with other clients of
    /// the same account, so a cooldown one of them hits applies to all.
    pub fn with_shared(
        config: RestConfig,
        credentials: Option<Credentials>,
        http: Client,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            http,
            config,
            credentials,
            limiter,
        }
    }

    pub fn http_client(timeout: Duration) -> Result<Client, RestError> {
        Ok(Client::builder().use_rustls_tls().timeout(timeout).build()?)
    }

    pub fn base_url(&self) -> &Url {
        &self.config.base_url
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T, RestError> {
        self.send(Method::GET, endpoint, params, signed).await
    }

    /// Parameters travel form-encoded in the body.
    pub async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T, RestError> {
        self.send(Method::POST, endpoint, params, signed).await
    }

    /// Query string for a request issued at `timestamp_ms`.
    pub fn build_query(
        &self,
        params: &[(&str, String)],
        signed: bool,
        timestamp_ms: i64,
    ) -> Result<String, RestError> {
        let pairs = params.iter().map(|(k, v)| (*k, v.as_str()));
        if !signed {
            return Ok(canonical_query(pairs));
        }
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            RestError::new(RestErrorKind::Request, "signed request without credentials")
        })?;
        Ok(signed_query(
            pairs,
            &credentials.api_secret,
            timestamp_ms,
            self.config.recv_window_ms,
        ))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T, RestError> {
        let query = self.build_query(params, signed, Utc::now().timestamp_millis())?;
        let mut url = self
            .config
            .base_url
            .join(endpoint)
            .map_err(|e| RestError::new(RestErrorKind::Request, format!("{endpoint}: {e}")))?;

        self.limiter.acquire().await?;
        debug!(%method, endpoint, params = params.len(), "REST request");

        let mut request = if method == Method::GET {
            if !query.is_empty() {
                url.set_query(Some(&query));
            }
            self.http.get(url)
        } else {
            self.http
                .request(method.clone(), url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(query)
        };
        if let Some(credentials) = &self.credentials {
            request = request.header(self.config.api_key_header, &credentials.api_key);
        }

        let response = request.send().await?;
        self.handle_response(endpoint, response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        response: Response,
    ) -> Result<T, RestError> {
        let status = response.status();
        debug!(endpoint, status = status.as_u16(), "REST response");

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            let wait = retry_after(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER);
            warn!(endpoint, status = status.as_u16(), ?wait, "Rate limited by exchange");
            self.limiter.cool_down(wait).await;
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::http(status.as_u16(), body));
        }

        let body = response.text().await?;
        if !status.is_success() {
            return Err(RestError::http(status.as_u16(), body));
        }

        serde_json::from_str(&body).map_err(|e| {
            warn!(endpoint, error = %e, "Failed to decode response");
            RestError::new(RestErrorKind::Decode, e.to_string())
        })
    }
}

/// `Retry-After` in delta-seconds form.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
