//! Error types for the Hivelimit service.

use thiserror::Error;

use crate::mesh::ClusterError;

/// Main error type for Hivelimit service wiring.
#[derive(Error, Debug)]
pub enum HivelimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// HTTP server errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for HivelimitError {
    fn from(err: config::ConfigError) -> Self {
        HivelimitError::Config(err.to_string())
    }
}

/// Result type alias for Hivelimit operations.
pub type Result<T> = std::result::Result<T, HivelimitError>;

/// Errors raised by counter stores and override sources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or could not answer.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The command may have been applied before the failure was observed.
    #[error("store outcome unknown: {0}")]
    Indeterminate(String),

    /// The store cannot perform this operation at all.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl StoreError {
    /// Whether repeating the failed command cannot double-apply it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors returned by a rate limiter's `limit` operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatelimitError {
    /// The request carried values the limiter cannot act on.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Counter or override state could not be read after retrying.
    #[error("rate limit state unavailable: {0}")]
    Unavailable(String),
}

impl RatelimitError {
    /// Stable machine-readable kind used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            RatelimitError::InvalidRequest(_) => "invalid_request",
            RatelimitError::Unavailable(_) => "unavailable",
        }
    }
}

impl From<StoreError> for RatelimitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg)
            | StoreError::Indeterminate(msg)
            | StoreError::Unsupported(msg) => RatelimitError::Unavailable(msg),
        }
    }
}
