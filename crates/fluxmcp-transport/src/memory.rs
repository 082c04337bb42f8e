//! In-memory channel-pair transport.
//!
//! [`pair`] returns two connected transports; messages sent on one side
//! arrive on the other in order. No serialization happens, which keeps the
//! pair cheap for tests and for embedding both endpoints in one process.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio_util::sync::CancellationToken;

use fluxmcp_protocol::Message;

use crate::error::{TransportError, TransportResult};
use crate::traits::{Transport, TransportState};

/// Queue depth of each direction of the pair.
const CHANNEL_DEPTH: usize = 64;

/// One side of an in-memory transport pair.
pub struct MemoryTransport {
    state: Arc<StdMutex<TransportState>>,
    outbound: StdMutex<Option<mpsc::Sender<Message>>>,
    inbound: TokioMutex<mpsc::Receiver<Message>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Create a connected transport pair.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
    (
        MemoryTransport::new(a_tx, b_rx),
        MemoryTransport::new(b_tx, a_rx),
    )
}

impl MemoryTransport {
    fn new(outbound: mpsc::Sender<Message>, inbound: mpsc::Receiver<Message>) -> Self {
        Self {
            state: Arc::new(StdMutex::new(TransportState::Connected)),
            outbound: StdMutex::new(Some(outbound)),
            inbound: TokioMutex::new(inbound),
            closed: CancellationToken::new(),
        }
    }

    fn sender(&self) -> TransportResult<mpsc::Sender<Message>> {
        self.outbound
            .lock()
            .expect("outbound mutex poisoned")
            .clone()
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: Message) -> TransportResult<()> {
        let sender = self.sender()?;
        sender
            .send(message)
            .await
            .map_err(|_| TransportError::ConnectionLost("peer disposed".to_string()))
    }

    async fn receive(&self) -> TransportResult<Option<Message>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Ok(None),
            message = inbound.recv() => Ok(message),
        }
    }

    fn state(&self) -> TransportState {
        *self.state.lock().expect("state mutex poisoned")
    }

    async fn dispose(&self) {
        *self.state.lock().expect("state mutex poisoned") = TransportState::Closed;
        // Dropping the sender lets the peer's receive() observe a clean close.
        self.outbound
            .lock()
            .expect("outbound mutex poisoned")
            .take();
        self.closed.cancel();
    }
}
