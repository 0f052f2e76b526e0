use std::fmt;

use common::ExchangeError;

/// What went wrong with a REST call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestErrorKind {
    Timeout,
    /// The connection was never established.
    Connect,
    /// Failure after the request may have been sent (reset, broken body).
    Transport,
    /// Non-2xx response.
    Http(u16),
    /// 2xx response whose body did not decode.
    Decode,
    /// Refused locally while cooling down after a 429/418.
    RateLimited,
    /// A signed call was made without credentials, or the request could not be built.
    Request,
}

impl fmt::Display for RestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestErrorKind::Timeout => write!(f, "timeout"),
            RestErrorKind::Connect => write!(f, "connect"),
            RestErrorKind::Transport => write!(f, "transport"),
            RestErrorKind::Http(status) => write!(f, "http {status}"),
            RestErrorKind::Decode => write!(f, "decode"),
            RestErrorKind::RateLimited => write!(f, "rate limited"),
            RestErrorKind::Request => write!(f, "request"),
        }
    }
}

/// Uniform failure of [`SignedClient`](super::SignedClient) calls.
///
/// `code` is the HTTP status for `Http`, otherwise `-1`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} ({code}): {message}")]
pub struct RestError {
    pub kind: RestErrorKind,
    pub code: i64,
    pub message: String,
}

impl RestError {
    pub fn new(kind: RestErrorKind, message: impl Into<String>) -> Self {
        let code = match kind {
            RestErrorKind::Http(status) => i64::from(status),
            _ => -1,
        };
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::new(RestErrorKind::Http(status), body)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self.kind,
            RestErrorKind::RateLimited | RestErrorKind::Http(429) | RestErrorKind::Http(418)
        )
    }
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            RestErrorKind::Timeout
        } else if err.is_connect() {
            RestErrorKind::Connect
        } else if err.is_builder() {
            RestErrorKind::Request
        } else if err.is_decode() {
            RestErrorKind::Decode
        } else if let Some(status) = err.status() {
            RestErrorKind::Http(status.as_u16())
        } else {
            RestErrorKind::Transport
        };
        RestError::new(kind, err.to_string())
    }
}

/// Classification used by every adapter: anything that may have reached the
/// exchange without a readable answer is an unknown outcome.
impl From<RestError> for ExchangeError {
    fn from(err: RestError) -> Self {
        let detail = err.to_string();
        match err.kind {
            RestErrorKind::Timeout | RestErrorKind::Transport | RestErrorKind::Decode => {
                ExchangeError::Unknown(detail)
            }
            RestErrorKind::Http(status) if status >= 500 => ExchangeError::Unknown(detail),
            RestErrorKind::Http(429) | RestErrorKind::Http(418) | RestErrorKind::RateLimited => {
                ExchangeError::RateLimited(detail)
            }
            RestErrorKind::Http(_) => ExchangeError::Rejected {
                code: err.code,
                message: err.message,
            },
            RestErrorKind::Connect => ExchangeError::Unavailable(detail),
            RestErrorKind::Request => ExchangeError::Unsupported(detail),
        }
    }
}
