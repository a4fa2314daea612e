//! Error types for the courier job dispatcher.

use thiserror::Error;

/// The main error type for courier.
#[derive(Error, Debug)]
pub enum CourierError {
    /// The broker connection or channel could not be established.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A publish was rejected or the channel was closed.
    #[error("Publish error: {0}")]
    Publish(String),

    /// A job type with no queue mapping was scheduled.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// A message body or report could not be decoded.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The job handler reported a business-level failure.
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    /// The job exceeded its execution deadline.
    #[error("Execution timeout: {0}")]
    ExecutionTimeout(String),

    /// The execution unit terminated abnormally.
    #[error("Execution crash: {0}")]
    ExecutionCrash(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl CourierError {
    /// Whether the broker is expected to redeliver the message on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CourierError::BrokerUnavailable(_)
                | CourierError::ExecutionTimeout(_)
                | CourierError::ExecutionCrash(_)
        )
    }
}

/// Result type alias using CourierError.
pub type Result<T> = std::result::Result<T, CourierError>;
