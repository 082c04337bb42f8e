//! The core transport trait.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fluxmcp_protocol::Message;

use crate::error::{TransportError, TransportResult};

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// Not yet connected
    #[default]
    Disconnected,
    /// Connected and exchanging messages
    Connected,
    /// Disposed; sends fail and receive terminates
    Closed,
}

/// A duplex byte-to-message channel.
///
/// The transport serializes and frames outbound messages and parses inbound
/// frames. `send` must be safe to call from multiple tasks concurrently; the
/// implementation linearises writes. `receive` is consumed by exactly one
/// task (the session dispatch loop).
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Serialize and write one message.
    async fn send(&self, message: Message) -> TransportResult<()>;

    /// Receive the next inbound message.
    ///
    /// Returns `Ok(None)` when the peer closed cleanly, and an error on an
    /// I/O fault. After [`Transport::dispose`] this terminates.
    async fn receive(&self) -> TransportResult<Option<Message>>;

    /// Current connection state.
    fn state(&self) -> TransportState;

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Tear the transport down. Idempotent; after disposal `receive`
    /// terminates and `send` fails with [`TransportError::Closed`].
    async fn dispose(&self);

    /// Send with best-effort cancellation of the outbound write.
    async fn send_cancellable(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        tokio::select! {
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.send(message) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _object_safe(_t: &dyn Transport) {}

    #[test]
    fn default_state_is_disconnected() {
        assert_eq!(TransportState::default(), TransportState::Disconnected);
    }
}
