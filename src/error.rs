//! Error taxonomy for the trading core.
//!
//! Risk blocks are not errors: they are returned as
//! [`crate::trading::RiskDecision::Block`] values.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the trading core.
#[derive(Debug, Error)]
pub enum TradingError {
    /// Market data was unavailable or could not be parsed.
    #[error("market data error: {0}")]
    MarketData(String),

    /// Local throttling could not grant a slot within its wait ceiling,
    /// or the exchange rejected a call for exceeding its limits.
    #[error("rate limit exceeded: {reason} (retry after {retry_after:?})")]
    RateLimitExceeded {
        reason: String,
        retry_after: Duration,
    },

    /// An order could not be executed.
    #[error("order execution error: {0}")]
    OrderExecution(String),

    /// Exchange connectivity or protocol failure.
    #[error("exchange error: {0}")]
    Exchange(String),

    /// Invalid or missing startup configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Too many consecutive cycle failures; the engine stopped.
    #[error("{failures} consecutive cycle failures, last: {last}")]
    ConsecutiveCycleFailure { failures: u32, last: String },

    /// The operation was interrupted by shutdown.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TradingError {
    /// Whether the engine should recover from this error and keep cycling.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TradingError::MarketData(_)
                | TradingError::RateLimitExceeded { .. }
                | TradingError::OrderExecution(_)
                | TradingError::Exchange(_)
                | TradingError::Http(_)
                | TradingError::Json(_)
        )
    }

    /// Short machine-readable kind, used in logs and cycle records.
    pub fn kind(&self) -> &'static str {
        match self {
            TradingError::MarketData(_) => "market_data",
            TradingError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            TradingError::OrderExecution(_) => "order_execution",
            TradingError::Exchange(_) => "exchange",
            TradingError::Configuration(_) => "configuration",
            TradingError::ConsecutiveCycleFailure { .. } => "consecutive_cycle_failure",
            TradingError::Cancelled => "cancelled",
            TradingError::Http(_) => "http",
            TradingError::Json(_) => "json",
        }
    }
}

/// Errors reported by exchange and market-data collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("exchange rate limit hit")]
    RateLimited,

    #[error("network failure: {0}")]
    Network(String),

    #[error("order {0} not found")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("request cancelled by shutdown")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl From<ExchangeError> for TradingError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::RateLimited => TradingError::RateLimitExceeded {
                reason: "exchange-side rate limit".to_string(),
                retry_after: Duration::ZERO,
            },
            ExchangeError::Rejected(reason) => TradingError::OrderExecution(reason),
            ExchangeError::Cancelled => TradingError::Cancelled,
            other => TradingError::Exchange(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.as_u16()) == Some(429) {
            ExchangeError::RateLimited
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(TradingError::MarketData("stale".into()).is_recoverable());
        assert!(TradingError::Exchange("down".into()).is_recoverable());
        assert!(!TradingError::Configuration("bad".into()).is_recoverable());
        assert!(!TradingError::Cancelled.is_recoverable());
        assert!(!TradingError::ConsecutiveCycleFailure {
            failures: 5,
            last: "x".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_exchange_error_conversion() {
        let err: TradingError = ExchangeError::RateLimited.into();
        assert_eq!(err.kind(), "rate_limit_exceeded");

        let err: TradingError = ExchangeError::Cancelled.into();
        assert!(matches!(err, TradingError::Cancelled));

        let err: TradingError = ExchangeError::Network("reset".into()).into();
        assert_eq!(err.kind(), "exchange");
        assert!(err.to_string().contains("reset"));
    }
}
