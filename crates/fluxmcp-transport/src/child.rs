//! Child-process transport.
//!
//! Spawns a command with piped stdio and speaks newline-delimited JSON
//! over its stdin/stdout, the standard way a host launches an MCP server.
//! The child's stderr is inherited so its logging stays visible. Disposal
//! kills the child and reaps it.

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

use fluxmcp_protocol::{MAX_MESSAGE_SIZE, Message};

use crate::error::{TransportError, TransportResult};
use crate::framing::LineChannel;
use crate::traits::{Transport, TransportState};

/// Transport over a spawned child process's stdio.
#[derive(Debug)]
pub struct ChildProcessTransport {
    inner: LineChannel,
    child: TokioMutex<Option<Child>>,
}

impl ChildProcessTransport {
    /// Spawn `command` with piped stdin/stdout and connect to it.
    ///
    /// Any stdio configuration already set on the command is overridden;
    /// stderr is inherited.
    pub fn spawn(mut command: Command) -> TransportResult<Self> {
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| TransportError::ConnectionFailed(format!("spawn failed: {e}")))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConfigurationError("child stdin missing after spawn".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConfigurationError("child stdout missing after spawn".to_string())
        })?;

        Ok(Self {
            // We read the child's stdout and write its stdin.
            inner: LineChannel::spawn(stdout, stdin, MAX_MESSAGE_SIZE),
            child: TokioMutex::new(Some(child)),
        })
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
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
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill child process");
            }
            match child.wait().await {
                Ok(status) => debug!(?status, "child process reaped"),
                Err(e) => warn!(error = %e, "failed to reap child process"),
            }
        }
    }
}
