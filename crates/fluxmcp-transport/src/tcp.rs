//! TCP transport.
//!
//! Plain TCP with the same newline-delimited JSON framing as stdio. One
//! socket carries one session; accepting servers wrap each accepted stream
//! in its own transport.

use async_trait::async_trait;
use tokio::net::{TcpStream, ToSocketAddrs};

use fluxmcp_protocol::{MAX_MESSAGE_SIZE, Message};

use crate::error::{TransportError, TransportResult};
use crate::framing::LineChannel;
use crate::traits::{Transport, TransportState};

/// Transport over a single TCP socket.
#[derive(Debug)]
pub struct TcpTransport {
    inner: LineChannel,
}

impl TcpTransport {
    /// Connect to a listening peer.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established socket (e.g. one returned by
    /// `TcpListener::accept`).
    pub fn from_stream(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            inner: LineChannel::spawn(reader, writer, MAX_MESSAGE_SIZE),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: Message) -> TransportResult<()> {
        self.inner.send(message).await
    }

    async fn receive(&self) -> TransportResult<Option<Message>> {
        self.inner.receive().await
    }

    fn state(&self) -> TransportState {
        self.inner.state()
    }

    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}
