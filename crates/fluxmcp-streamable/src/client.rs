//! Streamable HTTP client transport.
//!
//! Each outbound message is one POST; the server answers `202`, a JSON
//! body, or an SSE sub-stream, and all inbound messages funnel into one
//! queue the session engine drains. After the handshake assigns a session
//! id, an optional long-lived GET stream carries server-initiated traffic,
//! reconnecting with `Last-Event-ID` after drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fluxmcp_protocol::{Message, codec};
use fluxmcp_transport::{Transport, TransportError, TransportResult, TransportState};

use crate::session::{LAST_EVENT_ID_HEADER, SESSION_ID_HEADER};
use crate::sse::SseParser;

/// Client transport configuration.
#[derive(Debug, Clone)]
pub struct StreamableHttpClientConfig {
    /// Full endpoint URL (e.g. `http://127.0.0.1:8080/mcp`)
    pub endpoint: String,
    /// Open the long-lived GET stream once a session id is known
    pub open_get_stream: bool,
    /// Delay before reconnecting a dropped GET stream
    pub reconnect_delay: Duration,
}

impl StreamableHttpClientConfig {
    /// Configuration with defaults for the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            open_get_stream: true,
            reconnect_delay: Duration::from_secs(1),
        }
    }

    /// Do not open the GET stream (e.g. against stateless servers).
    pub fn without_get_stream(mut self) -> Self {
        self.open_get_stream = false;
        self
    }
}

/// Client side of the Streamable HTTP transport.
pub struct StreamableHttpClient {
    http: reqwest::Client,
    config: StreamableHttpClientConfig,
    state: Mutex<TransportState>,
    session_id: Arc<Mutex<Option<String>>>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: TokioMutex<mpsc::UnboundedReceiver<Message>>,
    /// Resumption cursor; only GET-stream events advance it.
    last_event_id: Arc<AtomicU64>,
    get_started: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for StreamableHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpClient")
            .field("endpoint", &self.config.endpoint)
            .field("state", &*self.state.lock())
            .field("session_id", &*self.session_id.lock())
            .finish_non_exhaustive()
    }
}

impl StreamableHttpClient {
    /// Create a transport for the given endpoint with default options.
    pub fn connect(endpoint: impl Into<String>) -> Self {
        Self::with_config(StreamableHttpClientConfig::new(endpoint))
    }

    /// Create a transport with explicit options.
    pub fn with_config(config: StreamableHttpClientConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            http: reqwest::Client::new(),
            config,
            state: Mutex::new(TransportState::Connected),
            session_id: Arc::new(Mutex::new(None)),
            inbound_tx,
            inbound_rx: TokioMutex::new(inbound_rx),
            last_event_id: Arc::new(AtomicU64::new(0)),
            get_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// The session id assigned by the server, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn mark_closed(&self) {
        *self.state.lock() = TransportState::Closed;
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        if self.session_id.lock().is_some() {
            return;
        }
        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            debug!(session_id = id, "session established");
            *self.session_id.lock() = Some(id.to_string());
        }
    }

    fn maybe_start_get_stream(&self) {
        if !self.config.open_get_stream
            || self.session_id.lock().is_none()
            || self.get_started.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let http = self.http.clone();
        let endpoint = self.config.endpoint.clone();
        let session_id = Arc::clone(&self.session_id);
        let inbound = self.inbound_tx.clone();
        let last_event_id = Arc::clone(&self.last_event_id);
        let shutdown = self.shutdown.clone();
        let delay = self.config.reconnect_delay;
        tokio::spawn(async move {
            run_get_stream(http, endpoint, session_id, inbound, last_event_id, shutdown, delay)
                .await;
        });
    }

    /// Drain an SSE sub-stream bound to one POST.
    fn spawn_substream_reader(&self, response: reqwest::Response) {
        let inbound = self.inbound_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::new();
            loop {
                let chunk = tokio::select! {
                    () = shutdown.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for event in parser.feed(&String::from_utf8_lossy(&bytes)) {
                            match codec::decode(&event.data) {
                                Ok(message) => {
                                    let _ = inbound.send(message);
                                }
                                Err(e) => warn!(error = %e, "unparseable SSE payload"),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "POST sub-stream ended with error");
                        return;
                    }
                    None => return,
                }
            }
        });
    }
}

#[async_trait]
impl Transport for StreamableHttpClient {
    async fn send(&self, message: Message) -> TransportResult<()> {
        if self.state() != TransportState::Connected {
            return Err(TransportError::Closed);
        }
        let payload = codec::encode(&message)?;

        let mut request = self
            .http
            .post(&self.config.endpoint)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        if let Some(id) = self.session_id.lock().clone() {
            request = request.header(SESSION_ID_HEADER, id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.capture_session_id(&response);

        let status = response.status();
        match status.as_u16() {
            202 | 204 => {}
            200 => {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if content_type.starts_with("text/event-stream") {
                    self.spawn_substream_reader(response);
                } else {
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
                    match codec::decode_bytes(&bytes) {
                        Ok(inbound) => {
                            let _ = self.inbound_tx.send(inbound);
                        }
                        Err(e) => warn!(error = %e, "unparseable JSON reply body"),
                    }
                }
            }
            404 => {
                // The session is gone; the caller must re-initialize.
                self.mark_closed();
                return Err(TransportError::ConnectionLost(
                    "session not found or expired".to_string(),
                ));
            }
            other => {
                return Err(TransportError::SendFailed(format!(
                    "unexpected HTTP status {other}"
                )));
            }
        }

        self.maybe_start_get_stream();
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<Message>> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            () = self.shutdown.cancelled() => Ok(None),
            message = inbound.recv() => Ok(message),
        }
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    async fn dispose(&self) {
        if self.state() == TransportState::Closed && self.shutdown.is_cancelled() {
            return;
        }
        self.mark_closed();
        self.shutdown.cancel();
        // Best-effort session teardown on the server.
        let session_id = self.session_id.lock().clone();
        if let Some(id) = session_id {
            let _ = self
                .http
                .delete(&self.config.endpoint)
                .header(SESSION_ID_HEADER, id)
                .send()
                .await;
        }
    }
}

async fn run_get_stream(
    http: reqwest::Client,
    endpoint: String,
    session_id: Arc<Mutex<Option<String>>>,
    inbound: mpsc::UnboundedSender<Message>,
    last_event_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let Some(id) = session_id.lock().clone() else {
            return;
        };
        let mut request = http
            .get(&endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(SESSION_ID_HEADER, id);
        let cursor = last_event_id.load(Ordering::Relaxed);
        if cursor > 0 {
            request = request.header(LAST_EVENT_ID_HEADER, cursor.to_string());
        }

        match request.send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                let mut stream = response.bytes_stream();
                let mut parser = SseParser::new();
                loop {
                    let chunk = tokio::select! {
                        () = shutdown.cancelled() => return,
                        chunk = stream.next() => chunk,
                    };
                    match chunk {
                        Some(Ok(bytes)) => {
                            for event in parser.feed(&String::from_utf8_lossy(&bytes)) {
                                if let Some(event_id) = event.id {
                                    last_event_id.store(event_id, Ordering::Relaxed);
                                }
                                match codec::decode(&event.data) {
                                    Ok(message) => {
                                        let _ = inbound.send(message);
                                    }
                                    Err(e) => warn!(error = %e, "unparseable GET-stream payload"),
                                }
                            }
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "GET stream interrupted; will resume");
                            break;
                        }
                        None => {
                            debug!("GET stream closed; will resume");
                            break;
                        }
                    }
                }
            }
            Ok(response) if matches!(response.status().as_u16(), 404 | 405) => {
                // Session gone or server offers no GET stream; stop quietly.
                debug!(status = response.status().as_u16(), "GET stream unavailable");
                return;
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "unexpected GET stream status");
            }
            Err(e) => {
                debug!(error = %e, "GET stream connect failed; will retry");
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = StreamableHttpClientConfig::new("http://127.0.0.1:1/mcp");
        assert!(config.open_get_stream);
        let config = config.without_get_stream();
        assert!(!config.open_get_stream);
    }

    #[tokio::test]
    async fn send_after_dispose_fails() {
        let client = StreamableHttpClient::connect("http://127.0.0.1:1/mcp");
        client.dispose().await;
        let err = client
            .send(fluxmcp_protocol::Notification::new("x", None).into())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn receive_terminates_on_dispose() {
        let client = StreamableHttpClient::connect("http://127.0.0.1:1/mcp");
        client.dispose().await;
        assert!(client.receive().await.unwrap().is_none());
    }
}
