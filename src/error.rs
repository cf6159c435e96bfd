//! Error types for the lending bot.

use crate::exchange::Currency;
use thiserror::Error;

/// Errors surfaced by the exchange layer and the lending strategy.
///
/// Transient failures (connection errors, HTTP 500) are retried inside the
/// request client and never show up here unless a bounded retry policy runs
/// out of attempts.
#[derive(Error, Debug)]
pub enum LendingError {
    /// Currency string not in the supported set, or no decay schedule for it.
    #[error("unrecognized currency: {0}")]
    UnrecognizedCurrency(String),

    /// Exchange answered with a non-200, non-retryable status.
    #[error("request to {path} failed with status {status}: {body}")]
    Request {
        path: String,
        status: u16,
        body: String,
    },

    /// Bounded retry policy gave up.
    #[error("request to {path} still failing after {attempts} attempts")]
    RetriesExhausted { path: String, attempts: u32 },

    /// Non-retryable transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body was not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Response was JSON but not in the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rebalancer was handed offers from more than one currency.
    #[error("mixed currencies in rebalance pass: expected {expected}, found {found}")]
    MixedCurrencies { expected: Currency, found: Currency },
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, LendingError>;
