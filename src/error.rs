//! Error types for queue operations.
//!
//! Defines the error conditions that can occur while publishing, claiming,
//! and consuming messages. Storage failures carry the backend's message so
//! workers can log them with context; cancellation is modelled as its own
//! variant because it is a clean-shutdown signal, not a failure.

use thiserror::Error;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, MqError>;

/// Error type covering storage, configuration, and consumer failures.
#[derive(Debug, Error)]
pub enum MqError {
    /// A storage backend operation failed.
    ///
    /// Workers treat this as "no work this cycle": the error is logged and
    /// the poll loop continues. The store never retries internally.
    #[error("storage error: {message}")]
    Storage {
        /// Backend error message.
        message: String,
    },

    /// Invalid or missing configuration detected at startup.
    #[error("configuration error: {message}")]
    Config {
        /// Configuration error message.
        message: String,
    },

    /// A consumer's consume call failed with an application error.
    ///
    /// Drives the retry-or-nack branch in the poll worker; never crashes
    /// the worker loop.
    #[error("consumer error: {0}")]
    Consumer(#[from] anyhow::Error),

    /// Cancellation was observed mid-operation.
    ///
    /// Not a failure: this is the only way a consume call signals that
    /// shutdown interrupted it, and it triggers the worker's in-flight
    /// recovery path instead of ack/nack bookkeeping.
    #[error("operation cancelled")]
    Cancelled,
}

impl MqError {
    /// Creates a storage error from a message.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Returns `true` if this error is the cancellation signal.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<sqlx::Error> for MqError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage { message: err.to_string() }
    }
}
