//! Error types for the Turnstile admission-control crate.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Rate-limit rejections are not errors: they are ordinary
/// [`Decision`](crate::ratelimit::Decision) values. This type covers
/// misconfiguration and I/O failures. Quota oracle failures are handled by
/// the organization limiter's fail-open policy and never surface here.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration file or environment could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter was constructed with a zero, negative or non-finite parameter
    #[error("Invalid configuration: {field} must be positive and finite, got {value}")]
    InvalidConfiguration { field: &'static str, value: f64 },

    /// A load factor that cannot be used to rescale a rate
    #[error("Invalid load factor: must be positive and finite, got {0}")]
    InvalidLoadFactor(f64),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Build an [`TurnstileError::InvalidConfiguration`] for `field`.
    pub fn invalid(field: &'static str, value: f64) -> Self {
        TurnstileError::InvalidConfiguration { field, value }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
