//! Error types for exchange access
//!
//! Failures are classified once, at the client boundary, so callers can
//! pick a retry strategy from the variant alone instead of parsing messages.

use std::time::Duration;
use thiserror::Error;

/// Timestamp outside the server's receive window; the local clock offset needs a resync.
pub const CODE_TIMESTAMP_OUTSIDE_WINDOW: i64 = -1021;
/// Signature did not match.
pub const CODE_INVALID_SIGNATURE: i64 = -1022;
/// API key format invalid.
pub const CODE_INVALID_API_KEY: i64 = -2014;
/// Invalid API key, IP, or permissions for action.
pub const CODE_REJECTED_API_KEY: i64 = -2015;
/// Locally rejected before reaching the exchange.
pub const CODE_LOCAL_REJECT: i64 = 0;

/// Every failure an exchange call can produce
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by exchange (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("failed to decode exchange response: {0}")]
    Decode(String),

    #[error("stale price for {instrument}: {age_ms} ms old")]
    StaleData { instrument: String, age_ms: i64 },
}

impl ExchangeError {
    /// Check if the call may succeed when repeated unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_)
                | ExchangeError::RateLimited { .. }
                | ExchangeError::Decode(_)
                | ExchangeError::StaleData { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExchangeError::Network(_) => "network",
            ExchangeError::RateLimited { .. } => "rate_limit",
            ExchangeError::Auth(_) => "auth",
            ExchangeError::Rejected { .. } => "rejected",
            ExchangeError::Decode(_) => "decode",
            ExchangeError::StaleData { .. } => "stale",
        }
    }

    /// Minimum wait the exchange asked for, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    pub fn needs_time_resync(&self) -> bool {
        matches!(
            self,
            ExchangeError::Rejected { code, .. } if *code == CODE_TIMESTAMP_OUTSIDE_WINDOW
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::Network(err.to_string())
    }
}

/// Result type alias using ExchangeError
pub type ExchangeResult<T> = Result<T, ExchangeError>;
