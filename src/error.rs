//! Error types for the Bulwark service.

use thiserror::Error;

/// Main error type for Bulwark operations.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Malformed configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be kept under its configured cap
    #[error("Counter store over capacity: {len} entries, cap {cap}")]
    Capacity { len: usize, cap: usize },

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for BulwarkError {
    fn from(err: config::ConfigError) -> Self {
        BulwarkError::Config(err.to_string())
    }
}

impl From<regex::Error> for BulwarkError {
    fn from(err: regex::Error) -> Self {
        BulwarkError::Config(format!("invalid pattern: {}", err))
    }
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;
