//! Error types for fio core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use thiserror::Error;

/// Result type alias for fio operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for fio.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka-related error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Lookup service error
    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// Kafka-specific errors.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Failed to create a client for the broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Topic subscription failed
    #[error("Subscription failed: {0}")]
    Subscription(String),

    /// Reading from the input topic failed
    #[error("Read failed: {0}")]
    Read(String),

    /// Offset commit failed
    #[error("Offset commit failed: {0}")]
    OffsetCommit(String),

    /// A record could not be delivered, dead-letter included
    #[error("Delivery to {topic} failed after {attempts} attempts: {message}")]
    DeliveryFailed {
        topic: String,
        attempts: u32,
        message: String,
    },
}

/// Errors from a single remote attribute lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Network or connection failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The per-call timeout elapsed
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// The service answered with a non-success status
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The body was not the expected JSON shape
    #[error("decode error: {0}")]
    Decode(String),

    /// The service is short-circuited after repeated failures
    #[error("circuit open for {0}")]
    CircuitOpen(String),
}

impl LookupError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LookupError::Transport(_) | LookupError::Timeout(_) => true,
            LookupError::Status { status, .. } => *status == 429 || *status >= 500,
            LookupError::Decode(_) | LookupError::CircuitOpen(_) => false,
        }
    }
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}
