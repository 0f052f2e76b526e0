use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing credentials for {exchange} (tenant {tenant})")]
    MissingCredentials { tenant: String, exchange: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of an exchange adapter call.
///
/// The split that matters to callers is [`ExchangeError::is_ambiguous`]:
/// an ambiguous order submission may or may not have reached the book and
/// must be reconciled with a status query before anything is resubmitted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// Rejected locally before any network call.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// The exchange answered with an error code.
    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// Refused client-side or by the exchange because of request limits.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The request never reached the exchange (e.g. connection refused).
    #[error("request not delivered: {0}")]
    Unavailable(String),

    /// Timeout, 5xx, or unreadable success body: outcome unknown.
    #[error("outcome unknown: {0}")]
    Unknown(String),

    /// The adapter cannot serve this bot at all (mode, symbol format, ...).
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ExchangeError {
    /// Outcome unknown: re-query before retrying.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ExchangeError::Unknown(_))
    }

    /// Definitely failed and safe to retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited(_) | ExchangeError::Unavailable(_) | ExchangeError::Rejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unknown_outcome_is_ambiguous() {
        assert!(ExchangeError::Unknown("timeout".into()).is_ambiguous());
        for err in [
            ExchangeError::InvalidOrder("qty".into()),
            ExchangeError::Rejected { code: 100400, message: "bad".into() },
            ExchangeError::OrderNotFound("x".into()),
            ExchangeError::RateLimited("slow down".into()),
            ExchangeError::Unavailable("refused".into()),
            ExchangeError::Unsupported("margin".into()),
        ] {
            assert!(!err.is_ambiguous(), "{err} should not be ambiguous");
        }
    }

    #[test]
    fn retryable_errors_are_definite() {
        assert!(ExchangeError::Unavailable("refused".into()).is_retryable());
        assert!(!ExchangeError::Unknown("timeout".into()).is_retryable());
        assert!(!ExchangeError::InvalidOrder("qty".into()).is_retryable());
    }
}
