//! Consumer error types

use std::io;
use thiserror::Error;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors surfaced by the consumer runtime
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Broker client errors
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// No tokio runtime available to host the worker pool
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Spawning the poll loop thread failed
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Shutdown errors
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

/// Errors reported by a broker client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Unrecoverable client state; aborts the owning poll loop
    #[error("Fatal broker error: {0}")]
    Fatal(String),

    /// Per-record or per-call error the loop can continue past
    #[error("Broker error: {0}")]
    Transient(String),

    /// Offset commit rejected or failed
    #[error("Commit error: {0}")]
    Commit(String),
}

impl BrokerError {
    /// Check if the error must abort the poll loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_))
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError;
        use rdkafka::types::RDKafkaErrorCode;

        match &err {
            KafkaError::ConsumerCommit(_) => BrokerError::Commit(err.to_string()),
            KafkaError::ClientCreation(_) | KafkaError::Subscription(_) => {
                BrokerError::Fatal(err.to_string())
            }
            _ if err.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal) => {
                BrokerError::Fatal(err.to_string())
            }
            _ => BrokerError::Transient(err.to_string()),
        }
    }
}

/// Error returned by a record handler
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Payload could not be decoded
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Business processing failed
    #[error("Processing error: {0}")]
    ProcessingError(String),

    /// Handler panicked; caught at the dispatcher boundary
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
