//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Malformed address or empty token. Always a client-input error.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Storage I/O failure, timeout, or a backend that has been closed.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Build a `BackendUnavailable` error from anything printable.
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        TurnstileError::BackendUnavailable(err.to_string())
    }

    /// Whether the error came from the storage layer.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, TurnstileError::BackendUnavailable(_))
    }
}

impl From<tokio::time::error::Elapsed> for TurnstileError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TurnstileError::BackendUnavailable("deadline exceeded".to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
