//! Error types for the capture core.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// History file is neither a history document nor a list of requests.
    #[error("Invalid history file: {0}")]
    InvalidHistory(String),

    /// Engine task error.
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Relay transport error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The receiving context is gone for good.
    #[error("Context invalidated")]
    ContextInvalidated,

    /// A single delivery failed.
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Engine task error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The engine task has stopped.
    #[error("Correlation engine is not running")]
    Stopped,

    /// The engine dropped the reply channel.
    #[error("Correlation engine dropped the reply")]
    NoReply,
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
