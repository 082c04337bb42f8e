//! Server-side session records and SSE routing.
//!
//! One logical MCP session is multiplexed across many HTTP exchanges. The
//! [`SseRouter`] is the meeting point: POST handlers inject inbound
//! messages and open per-request SSE sub-streams; the session engine sends
//! outbound messages through a [`ServerHttpTransport`] that routes each one
//! to the sub-stream owning its request id, else to the GET stream, else
//! drops it with a log entry.
//!
//! Sub-streams hold only channel ends, never the session; the parent
//! session owns the router and the engine (no ownership cycles).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use fluxmcp_protocol::{InitializeRequestParams, Message, RequestId, codec};
use fluxmcp_session::{Session, SessionConfig};
use fluxmcp_transport::{Transport, TransportError, TransportResult, TransportState};

use crate::config::StreamableHttpConfig;
use crate::sse::SseEvent;

/// HTTP header carrying the session identifier.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// HTTP header carrying the SSE resumption cursor.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Longest session id accepted from the wire.
pub const MAX_SESSION_ID_LEN: usize = 512;

/// Prefix of stateless session ids, which embed the initialize params.
pub(crate) const STATELESS_ID_PREFIX: &str = "slss-";

/// Mint an opaque session id.
pub fn mint_session_id() -> String {
    format!("mcp-{}", Uuid::new_v4().simple())
}

/// Encode the initialize params into a stateless session id, so any node
/// can reconstruct the negotiated view without shared state.
pub(crate) fn encode_stateless_id(
    params: &InitializeRequestParams,
) -> Result<String, serde_json::Error> {
    let blob = serde_json::to_vec(params)?;
    Ok(format!("{STATELESS_ID_PREFIX}{}", URL_SAFE_NO_PAD.encode(blob)))
}

/// Decode a stateless session id back into the initialize params.
pub(crate) fn decode_stateless_id(id: &str) -> Option<InitializeRequestParams> {
    let blob = id.strip_prefix(STATELESS_ID_PREFIX)?;
    let bytes = URL_SAFE_NO_PAD.decode(blob).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Bounded buffer of GET-stream events retained for resumption.
///
/// Events evicted before a client resumes are lost; the client treats any
/// dependent state as undefined.
#[derive(Debug)]
pub(crate) struct ReplayBuffer {
    events: VecDeque<SseEvent>,
    bytes: usize,
    max_events: usize,
    max_bytes: usize,
}

impl ReplayBuffer {
    pub(crate) fn new(max_events: usize, max_bytes: usize) -> Self {
        Self {
            events: VecDeque::new(),
            bytes: 0,
            max_events,
            max_bytes,
        }
    }

    pub(crate) fn push(&mut self, event: SseEvent) {
        self.bytes += event.frame_bytes();
        self.events.push_back(event);
        while self.events.len() > self.max_events || self.bytes > self.max_bytes {
            let Some(evicted) = self.events.pop_front() else {
                break;
            };
            self.bytes -= evicted.frame_bytes();
        }
    }

    /// Every retained event with id greater than `after`.
    pub(crate) fn replay_after(&self, after: u64) -> Vec<SseEvent> {
        self.events
            .iter()
            .filter(|e| e.id.is_some_and(|id| id > after))
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}

/// One POST's SSE sub-stream: the set of request ids it owes replies for
/// and the channel the HTTP response body drains.
#[derive(Debug)]
struct SubStream {
    tx: Mutex<Option<mpsc::UnboundedSender<SseEvent>>>,
    pending: Mutex<HashSet<RequestId>>,
}

impl SubStream {
    fn send(&self, event: SseEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Remove a satisfied id; closes the stream when the set empties.
    fn retire(&self, id: &RequestId) -> bool {
        let mut pending = self.pending.lock();
        pending.remove(id);
        if pending.is_empty() {
            self.tx.lock().take();
            true
        } else {
            false
        }
    }

    fn is_open(&self) -> bool {
        self.tx.lock().is_some()
    }
}

/// Outbound router and inbound queue for one logical session.
pub(crate) struct SseRouter {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound_rx: TokioMutex<mpsc::UnboundedReceiver<Message>>,
    state: Mutex<TransportState>,
    subs: Mutex<Vec<Arc<SubStream>>>,
    by_id: DashMap<RequestId, Arc<SubStream>>,
    get_stream: Mutex<Option<mpsc::UnboundedSender<SseEvent>>>,
    replay: Mutex<ReplayBuffer>,
    next_event_id: AtomicU64,
    allow_server_requests: bool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SseRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseRouter")
            .field("state", &*self.state.lock())
            .field("sub_streams", &self.subs.lock().len())
            .field("buffered", &self.replay.lock().len())
            .finish_non_exhaustive()
    }
}

impl SseRouter {
    pub(crate) fn new(config: &StreamableHttpConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: TokioMutex::new(rx),
            state: Mutex::new(TransportState::Connected),
            subs: Mutex::new(Vec::new()),
            by_id: DashMap::new(),
            get_stream: Mutex::new(None),
            replay: Mutex::new(ReplayBuffer::new(
                config.replay_buffer_events,
                config.replay_buffer_bytes,
            )),
            next_event_id: AtomicU64::new(1),
            allow_server_requests: !config.stateless,
            shutdown: CancellationToken::new(),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_event_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Feed an inbound message to the session engine.
    pub(crate) fn inject(&self, message: Message) -> bool {
        self.note_cancellations(&message);
        match self.inbound_tx.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// A cancelled request will never be answered; release its sub-stream
    /// slot so the owning POST response can complete.
    fn note_cancellations(&self, message: &Message) {
        match message {
            Message::Notification(n) if fluxmcp_protocol::methods::is_cancelled(&n.method) => {
                if let Some(params) = n.params.as_ref()
                    && let Ok(cancelled) =
                        serde_json::from_value::<fluxmcp_protocol::CancelledParams>(params.clone())
                    && let Some((_, sub)) = self.by_id.remove(&cancelled.request_id)
                    && sub.retire(&cancelled.request_id)
                {
                    self.subs.lock().retain(|s| s.is_open());
                }
            }
            Message::Batch(items) => {
                for item in items {
                    self.note_cancellations(item);
                }
            }
            _ => {}
        }
    }

    /// Open a sub-stream owing replies for `ids`.
    pub(crate) fn open_sub_stream(
        self: &Arc<Self>,
        ids: Vec<RequestId>,
    ) -> mpsc::UnboundedReceiver<SseEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = Arc::new(SubStream {
            tx: Mutex::new(Some(tx)),
            pending: Mutex::new(ids.iter().cloned().collect()),
        });
        for id in ids {
            self.by_id.insert(id, Arc::clone(&sub));
        }
        self.subs.lock().push(sub);
        rx
    }

    /// Attach (or replace) the session's GET stream, replaying every
    /// retained event with id greater than `last_event_id`.
    pub(crate) fn attach_get_stream(
        &self,
        last_event_id: Option<u64>,
    ) -> mpsc::UnboundedReceiver<SseEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(after) = last_event_id {
            for event in self.replay.lock().replay_after(after) {
                let _ = tx.send(event);
            }
        }
        // At most one GET stream per session; a new one displaces the old.
        *self.get_stream.lock() = Some(tx);
        rx
    }

    /// Route one outbound message.
    pub(crate) fn route_out(&self, message: &Message) -> TransportResult<()> {
        if *self.state.lock() != TransportState::Connected {
            return Err(TransportError::Closed);
        }
        if matches!(message, Message::Request(_)) && !self.allow_server_requests {
            return Err(TransportError::SendFailed(
                "server-initiated requests are not available in stateless mode".to_string(),
            ));
        }

        let data = codec::encode(message)?;

        // A reply goes to the sub-stream owning its id.
        if let Message::Response(response) = message
            && let Some(id) = response.id.as_request_id()
            && let Some((_, sub)) = self.by_id.remove(id)
        {
            sub.send(SseEvent::message(data).with_id(self.next_id()));
            if sub.retire(id) {
                self.subs.lock().retain(|s| s.is_open());
            }
            return Ok(());
        }

        // Notifications ride the oldest open sub-stream while one exists.
        if matches!(message, Message::Notification(_)) {
            let sub = self.subs.lock().iter().find(|s| s.is_open()).map(Arc::clone);
            if let Some(sub) = sub {
                sub.send(SseEvent::message(data).with_id(self.next_id()));
                return Ok(());
            }
        }

        self.send_on_get_stream(data);
        Ok(())
    }

    fn send_on_get_stream(&self, data: String) {
        let event = SseEvent::message(data).with_id(self.next_id());
        self.replay.lock().push(event.clone());
        let mut slot = self.get_stream.lock();
        match slot.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    // Client went away; keep buffering for resumption.
                    debug!("GET stream disconnected; buffering for resumption");
                    slot.take();
                }
            }
            None => {
                debug!("no GET stream attached; message retained only in replay buffer");
            }
        }
    }

    pub(crate) async fn recv_inbound(&self) -> TransportResult<Option<Message>> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            () = self.shutdown.cancelled() => Ok(None),
            message = rx.recv() => Ok(message),
        }
    }

    pub(crate) fn transport_state(&self) -> TransportState {
        *self.state.lock()
    }

    pub(crate) fn close(&self) {
        *self.state.lock() = TransportState::Closed;
        self.inbound_tx.lock().take();
        self.get_stream.lock().take();
        for sub in self.subs.lock().drain(..) {
            sub.tx.lock().take();
        }
        self.by_id.clear();
        self.shutdown.cancel();
    }
}

/// Transport half handed to the session engine for one logical session.
#[derive(Debug)]
pub(crate) struct ServerHttpTransport {
    router: Arc<SseRouter>,
}

impl ServerHttpTransport {
    pub(crate) fn new(router: Arc<SseRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Transport for ServerHttpTransport {
    async fn send(&self, message: Message) -> TransportResult<()> {
        self.router.route_out(&message)
    }

    async fn receive(&self) -> TransportResult<Option<Message>> {
        self.router.recv_inbound().await
    }

    fn state(&self) -> TransportState {
        self.router.transport_state()
    }

    async fn dispose(&self) {
        self.router.close();
    }
}

/// Callback that wires handlers onto each new logical session.
pub type SessionSetup = Arc<dyn Fn(&Session) + Send + Sync>;

/// One live logical session: its engine, router, and activity clock.
pub struct HttpServerSession {
    /// The session identifier clients echo in `mcp-session-id`
    pub id: String,
    engine: Session,
    router: Arc<SseRouter>,
    last_seen: Mutex<Instant>,
}

impl std::fmt::Debug for HttpServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerSession")
            .field("id", &self.id)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl HttpServerSession {
    /// Create the record, wire handlers via `setup`, and start the engine.
    pub(crate) fn start(
        id: String,
        session_config: SessionConfig,
        http_config: &StreamableHttpConfig,
        setup: &SessionSetup,
    ) -> Arc<Self> {
        let router = SseRouter::new(http_config);
        let engine = Session::new(ServerHttpTransport::new(Arc::clone(&router)), session_config);
        setup(&engine);
        engine.start();
        Arc::new(Self {
            id,
            engine,
            router,
            last_seen: Mutex::new(Instant::now()),
        })
    }

    pub(crate) fn router(&self) -> &Arc<SseRouter> {
        &self.router
    }

    /// The session engine, e.g. for server-initiated requests.
    pub fn engine(&self) -> &Session {
        &self.engine
    }

    pub(crate) fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.last_seen.lock().elapsed()
    }

    /// Tear the logical session down.
    pub async fn dispose(&self) {
        self.router.close();
        self.engine.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxmcp_protocol::{Capabilities, Implementation, Notification, Request, Response};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn router() -> Arc<SseRouter> {
        SseRouter::new(&StreamableHttpConfig::default())
    }

    #[test]
    fn replay_buffer_evicts_by_count() {
        let mut buffer = ReplayBuffer::new(3, usize::MAX);
        for n in 1..=5u64 {
            buffer.push(SseEvent::message(format!("{{\"n\":{n}}}")).with_id(n));
        }
        assert_eq!(buffer.len(), 3);
        let ids: Vec<u64> = buffer.replay_after(0).iter().map(|e| e.id.unwrap()).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn replay_buffer_evicts_by_bytes() {
        let mut buffer = ReplayBuffer::new(usize::MAX, 200);
        for n in 1..=10u64 {
            buffer.push(SseEvent::message("x".repeat(50)).with_id(n));
        }
        assert!(buffer.len() < 10);
        // The newest events survive.
        assert!(buffer.replay_after(0).last().unwrap().id == Some(10));
    }

    #[test]
    fn replay_after_partial_retention() {
        let mut buffer = ReplayBuffer::new(6, usize::MAX);
        for n in 1..=50u64 {
            buffer.push(SseEvent::message(format!("{{\"n\":{n}}}")).with_id(n));
        }
        // Only 45..=50 retained; a client asking from 40 gets what is left.
        let ids: Vec<u64> = buffer.replay_after(40).iter().map(|e| e.id.unwrap()).collect();
        assert_eq!(ids, vec![45, 46, 47, 48, 49, 50]);
    }

    #[tokio::test]
    async fn responses_route_to_their_sub_stream_then_close_it() {
        let router = router();
        let mut rx = router.open_sub_stream(vec![RequestId::Number(1), RequestId::Number(2)]);

        router
            .route_out(&Response::success(RequestId::Number(1), json!({})).into())
            .unwrap();
        router
            .route_out(&Response::success(RequestId::Number(2), json!({})).into())
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.id.unwrap() < second.id.unwrap());
        // Both ids satisfied: the sub-stream closes.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn notifications_ride_an_open_sub_stream() {
        let router = router();
        let mut rx = router.open_sub_stream(vec![RequestId::Number(1)]);

        router
            .route_out(&Notification::new("evt", None).into())
            .unwrap();
        router
            .route_out(&Response::success(RequestId::Number(1), json!({})).into())
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(first.data.contains("evt"));
        let second = rx.recv().await.unwrap();
        assert!(second.data.contains("result"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unowned_messages_fall_back_to_the_get_stream() {
        let router = router();
        let mut get = router.attach_get_stream(None);
        router
            .route_out(&Notification::new("evt", None).into())
            .unwrap();
        let event = get.recv().await.unwrap();
        assert!(event.data.contains("evt"));
        assert!(event.id.is_some());
    }

    #[tokio::test]
    async fn get_stream_resumption_replays_missed_events() {
        let router = router();
        // No GET stream attached: events are buffered with ids 1..=5.
        for n in 0..5 {
            router
                .route_out(&Notification::new("evt", Some(json!({"n": n}))).into())
                .unwrap();
        }
        let mut resumed = router.attach_get_stream(Some(2));
        let mut ids = Vec::new();
        while let Ok(event) = resumed.try_recv() {
            ids.push(event.id.unwrap());
        }
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn event_ids_are_monotonic_across_streams() {
        let router = router();
        let mut sub = router.open_sub_stream(vec![RequestId::Number(1)]);
        let mut get = router.attach_get_stream(None);

        router
            .route_out(&Response::success(RequestId::Number(1), json!({})).into())
            .unwrap();
        router
            .route_out(&Notification::new("evt", None).into())
            .unwrap();

        let on_sub = sub.recv().await.unwrap().id.unwrap();
        let on_get = get.recv().await.unwrap().id.unwrap();
        assert!(on_sub < on_get);
    }

    #[tokio::test]
    async fn stateless_mode_rejects_server_initiated_requests() {
        let config = StreamableHttpConfig {
            stateless: true,
            ..Default::default()
        };
        let router = SseRouter::new(&config);
        let err = router
            .route_out(&Request::new("roots/list", None, RequestId::Number(1)).into())
            .unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
    }

    #[test]
    fn stateless_ids_round_trip_the_initialize_params() {
        let params = InitializeRequestParams {
            protocol_version: "2025-03-26".to_string(),
            capabilities: Capabilities::new().with("sampling"),
            client_info: Implementation::new("t", "0"),
        };
        let id = encode_stateless_id(&params).unwrap();
        assert!(id.starts_with(STATELESS_ID_PREFIX));
        let decoded = decode_stateless_id(&id).unwrap();
        assert_eq!(decoded.protocol_version, "2025-03-26");
        assert!(decoded.capabilities.supports("sampling"));
        assert_eq!(decoded.client_info.name, "t");
    }

    #[test]
    fn foreign_ids_do_not_decode() {
        assert!(decode_stateless_id("mcp-abcdef").is_none());
        assert!(decode_stateless_id("slss-!!!").is_none());
    }

    #[test]
    fn minted_ids_are_opaque_and_unique() {
        let a = mint_session_id();
        let b = mint_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("mcp-"));
        assert!(a.len() <= MAX_SESSION_ID_LEN);
    }
}
