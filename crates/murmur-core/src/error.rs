//! Error types for bus operations.

use thiserror::Error;

/// Errors that can occur while talking to the message bus.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The message could not be handed to the transport.
    #[error("failed to send message '{msg_type}': {reason}")]
    SendFailed {
        /// The message type that failed.
        msg_type: String,
        /// Reason for failure.
        reason: String,
    },

    /// The bus has been closed and accepts no more traffic.
    #[error("message bus is closed")]
    Closed,

    /// The message payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BusError {
    /// Creates a send failure for the given message type.
    pub fn send_failed(msg_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SendFailed {
            msg_type: msg_type.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
