//! Transport error types.

use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors produced by transport implementations.
///
/// A transport fault is terminal for the connection: the session engine
/// fails every outstanding request and exits its dispatch loop. Nothing at
/// this layer retries.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Failed to send a message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a message.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The transport has been disposed; sends fail definitively.
    #[error("Transport closed")]
    Closed,

    /// The send was cancelled before completing.
    #[error("Send cancelled")]
    Cancelled,

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Message size exceeds the configured maximum.
    #[error("Message size ({size} bytes) exceeds maximum allowed ({max} bytes)")]
    MessageTooLarge {
        /// Actual payload size in bytes
        size: usize,
        /// Maximum allowed size in bytes
        max: usize,
    },

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

/// Validates a payload size against an optional limit.
pub fn validate_message_size(size: usize, max: Option<usize>) -> TransportResult<()> {
    if let Some(max) = max
        && size > max
    {
        return Err(TransportError::MessageTooLarge { size, max });
    }
    Ok(())
}
