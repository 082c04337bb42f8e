//! Session error taxonomy.

use std::time::Duration;
use thiserror::Error;

use fluxmcp_protocol::ProtocolError;
use fluxmcp_transport::TransportError;

/// A specialized `Result` type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by the session engine.
///
/// Protocol errors are surfaced to the originating caller and never retried
/// automatically. Transport faults are terminal: every outstanding caller
/// sees [`SessionError::TransportClosed`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SessionError {
    /// The transport failed or closed with this request still outstanding.
    #[error("transport closed with the request outstanding")]
    TransportClosed,

    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer answered with a JSON-RPC error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer pinned a protocol version this endpoint does not support.
    #[error("protocol version mismatch: proposed {proposed}, peer answered {answered}")]
    VersionMismatch {
        /// Version this endpoint proposed
        proposed: String,
        /// Version the peer answered with
        answered: String,
    },

    /// The handshake did not complete within the configured timeout.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Traffic was attempted before the handshake completed.
    #[error("session is not ready: the initialize exchange has not completed")]
    NotReady,

    /// The request was cancelled locally or timed out.
    #[error("request cancelled")]
    Cancelled,

    /// The session has been disposed.
    #[error("session disposed")]
    Disposed,

    /// The peer did not declare a capability this operation needs.
    #[error("peer does not support the '{0}' capability")]
    CapabilityNotSupported(String),

    /// The pending-request map is at its configured bound.
    #[error("too many outstanding requests (limit {0})")]
    PendingLimitReached(usize),

    /// A payload failed to (de)serialize.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    /// Short label used for metrics and logging.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::TransportClosed | Self::Transport(_) => "transport_error",
            Self::Protocol(_) => "protocol_error",
            Self::VersionMismatch { .. } | Self::HandshakeTimeout(_) => "handshake_error",
            Self::NotReady => "not_ready",
            Self::Cancelled => "cancelled",
            Self::Disposed => "disposed",
            Self::CapabilityNotSupported(_) => "capability_unsupported",
            Self::PendingLimitReached(_) => "pending_limit",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_pass_through() {
        let err: SessionError = ProtocolError::new(-32001, "tool failed").into();
        assert_eq!(err.to_string(), "tool failed (code -32001)");
        assert_eq!(err.outcome(), "protocol_error");
    }

    #[test]
    fn outcomes_are_stable_labels() {
        assert_eq!(SessionError::TransportClosed.outcome(), "transport_error");
        assert_eq!(SessionError::Cancelled.outcome(), "cancelled");
        assert_eq!(
            SessionError::HandshakeTimeout(Duration::from_secs(60)).outcome(),
            "handshake_error"
        );
    }
}
