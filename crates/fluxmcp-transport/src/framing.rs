//! Newline-delimited JSON framing over arbitrary async byte streams.
//!
//! Stream transports (stdio, TCP) share this channel: a background reader
//! task turns framed lines into parsed messages on an mpsc queue, and a
//! mutex-guarded framed writer linearises concurrent sends. Messages are
//! delimited by newlines and must not contain embedded newlines; the
//! compact codec guarantees that for well-formed messages.

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fluxmcp_protocol::{Message, codec};

use crate::error::{TransportError, TransportResult};
use crate::traits::TransportState;

type BoxedWrite = Pin<Box<dyn AsyncWrite + Send + 'static>>;
type LineWriter = FramedWrite<BoxedWrite, LinesCodec>;

/// Queue depth between the reader task and `receive` callers.
const RECEIVE_QUEUE_DEPTH: usize = 64;

/// Shared line-framed duplex channel used by the stream transports.
pub(crate) struct LineChannel {
    state: Arc<StdMutex<TransportState>>,
    writer: Arc<TokioMutex<Option<LineWriter>>>,
    incoming: TokioMutex<mpsc::Receiver<TransportResult<Message>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineChannel")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LineChannel {
    /// Start a channel over the given streams and spawn its reader task.
    pub(crate) fn spawn<R, W>(reader: R, writer: W, max_frame: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(RECEIVE_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        let reader_shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut frames = FramedRead::new(
                BufReader::new(Box::pin(reader) as Pin<Box<dyn AsyncRead + Send>>),
                LinesCodec::new_with_max_length(max_frame),
            );
            loop {
                let frame = tokio::select! {
                    () = reader_shutdown.cancelled() => break,
                    frame = frames.next() => frame,
                };
                match frame {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match codec::decode(&line) {
                            Ok(message) => {
                                if tx.send(Ok(message)).await.is_err() {
                                    break;
                                }
                            }
                            // Malformed frames are dropped; the stream
                            // itself is still usable.
                            Err(e) => {
                                warn!(error = %e, "dropping unparseable frame");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(TransportError::ReceiveFailed(e.to_string())))
                            .await;
                        break;
                    }
                    None => {
                        debug!("peer closed the stream");
                        break;
                    }
                }
            }
        });

        Self {
            state: Arc::new(StdMutex::new(TransportState::Connected)),
            writer: Arc::new(TokioMutex::new(Some(FramedWrite::new(
                Box::pin(writer) as BoxedWrite,
                LinesCodec::new(),
            )))),
            incoming: TokioMutex::new(rx),
            shutdown,
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock().expect("state mutex poisoned")
    }

    pub(crate) async fn send(&self, message: Message) -> TransportResult<()> {
        if self.state() != TransportState::Connected {
            return Err(TransportError::Closed);
        }
        let line = codec::encode(&message)?;
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(TransportError::Closed);
        };
        writer
            .send(line)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    pub(crate) async fn receive(&self) -> TransportResult<Option<Message>> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => {
                self.mark_closed();
                Err(e)
            }
            None => {
                self.mark_closed();
                Ok(None)
            }
        }
    }

    pub(crate) async fn dispose(&self) {
        self.mark_closed();
        self.shutdown.cancel();
        // Flush and drop the writer so the peer observes EOF.
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = SinkExt::<String>::flush(&mut w).await;
        }
    }

    fn mark_closed(&self) {
        *self.state.lock().expect("state mutex poisoned") = TransportState::Closed;
    }
}
