use thiserror::Error;

use crate::scheduler::ParallelizerStatus;

/// Application-wide error types for sluice.
#[derive(Error, Debug)]
pub enum AppError {
    /// A lifecycle command was issued from a state that does not allow it.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ParallelizerStatus,
    },

    /// Invalid job or pool configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No proxy can be lent right now and the pool policy did not produce one.
    #[error("No valid proxy available")]
    NoProxyAvailable,

    /// The operation observed the job's cancellation signal.
    #[error("Operation cancelled")]
    Cancelled,

    /// A proxy line could not be parsed.
    #[error("Invalid proxy '{input}': {reason}")]
    ProxyParseError { input: String, reason: String },

    /// A proxy source failed to produce its list.
    #[error("Proxy source '{source_name}' failed: {message}")]
    ProxySourceError {
        source_name: String,
        message: String,
    },

    /// A hit sink failed to persist a hit.
    #[error("Hit sink '{sink}' failed: {message}")]
    SinkError { sink: String, message: String },

    /// The bot raised an unexpected failure while checking a record.
    #[error("Bot error: {0}")]
    BotError(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::NoProxyAvailable
            | AppError::ProxySourceError { .. } => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }
}
