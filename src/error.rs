//! Error types for Ratewarden.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Invalid rate limit parameters or settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// The authoritative check found the key over budget
    #[error("too many requests per second for {key}")]
    RateExceeded { key: String },

    /// The shared store could not be consulted (fail-closed only)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl RateLimitError {
    /// Whether this error is a rate limit rejection.
    pub fn is_rate_exceeded(&self) -> bool {
        matches!(self, RateLimitError::RateExceeded { .. })
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
