//! Standard I/O transport.
//!
//! Newline-delimited JSON over stdin/stdout, the conventional framing for
//! MCP servers launched as child processes. Logging must go to stderr
//! (`tracing`'s default) so it never corrupts the message stream.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

use fluxmcp_protocol::{MAX_MESSAGE_SIZE, Message};

use crate::error::{TransportError, TransportResult};
use crate::framing::LineChannel;
use crate::traits::{Transport, TransportState};

/// Transport over the current process's stdio or a child process's pipes.
#[derive(Debug)]
pub struct StdioTransport {
    inner: LineChannel,
}

impl StdioTransport {
    /// Use the current process's stdin/stdout.
    pub fn new() -> Self {
        Self::from_raw(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Use a spawned child process's pipes.
    ///
    /// The child must have been spawned with `stdin(Stdio::piped())` and
    /// `stdout(Stdio::piped())`.
    pub fn from_child(child: &mut Child) -> TransportResult<Self> {
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConfigurationError(
                "child stdin was not piped; spawn with Stdio::piped()".to_string(),
            )
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConfigurationError(
                "child stdout was not piped; spawn with Stdio::piped()".to_string(),
            )
        })?;
        // We read the child's stdout and write its stdin.
        Ok(Self::from_raw(stdout, stdin))
    }

    /// Use arbitrary async streams.
    ///
    /// `reader` is the stream inbound messages arrive on; `writer` receives
    /// outbound frames.
    pub fn from_raw<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            inner: LineChannel::spawn(reader, writer, MAX_MESSAGE_SIZE),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
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
