//! Error types shared across the relay workspace

use thiserror::Error;

/// Result type alias for shared relay helpers
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised by the shared helpers in this crate
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}
