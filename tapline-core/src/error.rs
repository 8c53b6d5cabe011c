//! Error types for tapline-core
//!
//! Failures are split by the boundary they come from. Persistence and
//! delivery failures are always recoverable by retry; configuration errors
//! are fatal at construction time.

use thiserror::Error;

/// Persistence operation failed
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored row could not be turned back into a record
    #[error("corrupt stored record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// The persistence lane has shut down
    #[error("event store writer is closed")]
    Closed,

    /// A blocking store task panicked or was cancelled
    #[error("store task failed: {0}")]
    Task(String),
}

/// Network delivery failed; nothing in the batch is considered delivered
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Connectivity reports the collector is unreachable, no request was made
    #[error("collector is unreachable")]
    Offline,

    /// Transport-level failure (connect, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// Collector answered with a non-success status
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },

    /// Response body could not be decoded
    #[error("failed to parse response: {0}")]
    Decode(String),
}

impl DeliveryError {
    /// Whether an immediate in-client retry is worthwhile
    ///
    /// 5xx responses and transport failures are transient; 4xx and decode
    /// errors will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Request(_) => true,
            DeliveryError::Status { status, .. } => *status >= 500,
            DeliveryError::Offline | DeliveryError::Decode(_) => false,
        }
    }
}

/// Main error type for the tapline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Event store error
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Delivery error
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tapline-core
pub type Result<T> = std::result::Result<T, Error>;
