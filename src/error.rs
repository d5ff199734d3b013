//! Error types for the rate limiting engine.

use thiserror::Error;

/// Main error type for limiter operations.
///
/// A `Denied` verdict is not an error; these variants cover configuration
/// mistakes and storage failures the engine could not resolve on its own.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Rejected at setup time: bad capacity, rate, window or timeout.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Every compare-and-swap attempt lost a race. The whole check may be retried.
    #[error("Storage contention on key {key}: gave up after {attempts} attempts")]
    StorageContention { key: String, attempts: u32 },

    /// The backing store could not be reached within the configured deadline.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Configuration file parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Shorthand for building an [`LimiterError::InvalidConfiguration`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        LimiterError::InvalidConfiguration(msg.into())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
