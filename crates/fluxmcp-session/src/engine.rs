//! The duplex session engine.
//!
//! One [`Session`] wraps one transport and multiplexes both directions of a
//! JSON-RPC conversation over it: locally-issued requests wait on oneshot
//! completers keyed by id, incoming requests run on spawned handler tasks,
//! and cancellation and progress notifications are correlated to whichever
//! side owns the id or token.
//!
//! A single dispatch task is the only consumer of `transport.receive()`.
//! It routes each inbound message with table lookups and completer writes,
//! spawns handler work, and never awaits a handler. Its suspension points
//! are exactly transport receive and transport send.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use dashmap::DashMap;
use fluxmcp_protocol::{
    Capabilities, CancelledParams, EmptyResult, ErrorObject, Implementation,
    InitializeRequestParams, InitializeResult, LoggingLevel, LoggingMessageParams, Message,
    Notification, ProgressParams, Request, RequestId, Response, SetLevelParams, error_codes, meta,
    methods, LATEST_PROTOCOL_VERSION,
};
use fluxmcp_transport::Transport;

use crate::allocator::RequestIdAllocator;
use crate::diagnostics::{MetricsObserver, SessionObserver, TraceContext};
use crate::error::{SessionError, SessionResult};
use crate::handshake::{self, PeerInfo};
use crate::lifecycle::{SessionState, StateCell};
use crate::pending::{PendingMap, PendingRequest};
use crate::progress::{ProgressRouter, ProgressSink};
use crate::registry::{
    HandlerRegistry, NotificationHandler, Registration, RequestContext, RequestHandler,
};

/// Which side of the handshake this endpoint plays.
///
/// Sessions are otherwise symmetric: either side may issue requests once
/// the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Initiates the handshake (`initialize` + `initialized`)
    Client,
    /// Answers the handshake
    Server,
}

/// Session construction parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Handshake role
    pub role: EndpointRole,
    /// This endpoint's implementation info
    pub info: Implementation,
    /// This endpoint's capability descriptor
    pub capabilities: Capabilities,
    /// Usage instructions a server includes in its initialize result
    pub instructions: Option<String>,
    /// Bound on the initialize exchange
    pub handshake_timeout: Duration,
    /// Bound on concurrently outstanding outgoing requests
    pub max_pending_requests: usize,
}

impl SessionConfig {
    /// Client-role configuration with defaults.
    pub fn client(info: Implementation) -> Self {
        Self::new(EndpointRole::Client, info)
    }

    /// Server-role configuration with defaults.
    pub fn server(info: Implementation) -> Self {
        Self::new(EndpointRole::Server, info)
    }

    fn new(role: EndpointRole, info: Implementation) -> Self {
        Self {
            role,
            info,
            capabilities: Capabilities::new(),
            instructions: None,
            handshake_timeout: Duration::from_secs(60),
            max_pending_requests: 1024,
        }
    }

    /// Set the capability descriptor.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the server instructions.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Override the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Per-request options for [`Session::send_request_with`].
#[derive(Default)]
pub struct RequestOptions {
    /// Cancels the request; the engine notifies the peer best-effort
    pub cancellation: Option<CancellationToken>,
    /// Local deadline; expiry is equivalent to cancellation
    pub timeout: Option<Duration>,
    /// Sink for progress updates; the engine mints and injects the token
    pub progress: Option<ProgressSink>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("cancellation", &self.cancellation.is_some())
            .field("timeout", &self.timeout)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl RequestOptions {
    /// Attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Attach a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a progress sink.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }
}

/// A live MCP session over one transport.
///
/// Cheap to clone; all clones share the same underlying session.
#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

type NotificationJob = (Notification, Vec<NotificationHandler>);

pub(crate) struct SessionInner {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    allocator: RequestIdAllocator,
    pending: PendingMap,
    inflight: DashMap<RequestId, CancellationToken>,
    registry: Arc<HandlerRegistry>,
    progress: ProgressRouter,
    state: StateCell,
    peer: RwLock<Option<PeerInfo>>,
    /// Minimum level the peer asked us to forward via `logging/setLevel`.
    min_log_level: RwLock<LoggingLevel>,
    observer: Arc<dyn SessionObserver>,
    /// Tripped on disposal; parent of every handler task's token.
    shutdown: CancellationToken,
    /// Tracks handler tasks and notification workers for joined teardown.
    tracker: TaskTracker,
    /// Per-method serial queues for notification fan-out.
    notify_queues: DashMap<String, mpsc::UnboundedSender<NotificationJob>>,
    dispatch_started: AtomicBool,
    finalized: tokio::sync::Mutex<bool>,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("role", &self.config.role)
            .field("state", &self.state.get())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session with the default metrics observer.
    pub fn new(transport: impl Transport + 'static, config: SessionConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(MetricsObserver))
    }

    /// Create a session with an explicit observer (tests substitute a
    /// recorder here).
    pub fn with_observer(
        transport: impl Transport + 'static,
        config: SessionConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            transport: Arc::new(transport),
            pending: PendingMap::new(config.max_pending_requests),
            config,
            allocator: RequestIdAllocator::new(),
            inflight: DashMap::new(),
            registry: HandlerRegistry::new(),
            progress: ProgressRouter::new(),
            state: StateCell::new(),
            peer: RwLock::new(None),
            min_log_level: RwLock::new(LoggingLevel::Debug),
            observer,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            notify_queues: DashMap::new(),
            dispatch_started: AtomicBool::new(false),
            finalized: tokio::sync::Mutex::new(false),
        });
        Self { inner }
    }

    /// Start the dispatch loop and the handshake watchdog.
    ///
    /// Idempotent; the first call moves the session to `HandshakePending`.
    pub fn start(&self) {
        if self.inner.dispatch_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.state.advance(SessionState::Connecting);
        self.inner.state.advance(SessionState::HandshakePending);
        self.inner.observer.session_count_changed(1);

        let loop_inner = Arc::clone(&self.inner);
        tokio::spawn(async move { SessionInner::run_dispatch(loop_inner).await });

        let watchdog = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let timeout = watchdog.config.handshake_timeout;
            tokio::select! {
                () = watchdog.shutdown.cancelled() => {}
                () = watchdog.state.wait_for(SessionState::Ready) => {}
                () = tokio::time::sleep(timeout) => {
                    if watchdog.state.get() < SessionState::Ready {
                        warn!(?timeout, "handshake timed out; disposing session");
                        watchdog.dispose().await;
                    }
                }
            }
        });
    }

    /// Run the initialize exchange (client role).
    ///
    /// Sends `initialize`, validates the answered protocol version, emits
    /// `initialized`, and moves the session to `Ready`. On a version this
    /// endpoint does not support the session is torn down and
    /// [`SessionError::VersionMismatch`] is returned.
    pub async fn initialize(&self) -> SessionResult<InitializeResult> {
        if self.inner.config.role != EndpointRole::Client {
            return Err(SessionError::NotReady);
        }
        self.start();

        let params = InitializeRequestParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.inner.config.capabilities.clone(),
            client_info: self.inner.config.info.clone(),
        };
        let timeout = self.inner.config.handshake_timeout;
        let options = RequestOptions::default().with_timeout(timeout);
        let value = self
            .send_request_with(methods::INITIALIZE, Some(serde_json::to_value(&params)?), options)
            .await
            .map_err(|e| match e {
                SessionError::Cancelled => SessionError::HandshakeTimeout(timeout),
                other => other,
            })?;
        let result: InitializeResult = serde_json::from_value(value)?;

        if !handshake::supports_version(&result.protocol_version) {
            let answered = result.protocol_version.clone();
            self.dispose().await;
            return Err(SessionError::VersionMismatch {
                proposed: LATEST_PROTOCOL_VERSION.to_string(),
                answered,
            });
        }

        *self.inner.peer.write() = Some(PeerInfo {
            protocol_version: result.protocol_version.clone(),
            capabilities: result.capabilities.clone(),
            implementation: result.server_info.clone(),
        });

        self.send_notification(methods::INITIALIZED, None).await?;
        self.inner.state.advance(SessionState::Ready);
        Ok(result)
    }

    /// Issue a request and wait for the correlated reply.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> SessionResult<Value> {
        self.send_request_with(method, params, RequestOptions::default())
            .await
    }

    /// Issue a request with cancellation, timeout, or a progress sink.
    pub async fn send_request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> SessionResult<Value> {
        self.inner.send_request(method, params, options).await
    }

    /// Fire-and-forget notification.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> SessionResult<()> {
        self.inner.send_notification(method, params).await
    }

    /// Emit a `notifications/message` log notification, honouring the
    /// minimum level the peer selected and its `logging` capability.
    pub async fn send_log_message(
        &self,
        level: LoggingLevel,
        logger: Option<&str>,
        data: Value,
    ) -> SessionResult<()> {
        self.inner.send_log_message(level, logger, data).await
    }

    /// Install the request handler for `method`, replacing any previous one.
    pub fn register_request_handler(&self, method: &str, handler: RequestHandler) -> Registration {
        self.inner.registry.register_request(method, handler)
    }

    /// Append a notification handler for `method`. Handlers sharing a
    /// method run in registration order and observe notifications in
    /// transport-arrival order.
    pub fn register_notification_handler(
        &self,
        method: &str,
        handler: NotificationHandler,
    ) -> Registration {
        self.inner.registry.register_notification(method, handler)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// Whether the handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.inner.state.get() == SessionState::Ready
    }

    /// The negotiated peer view, once the handshake has produced one.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.inner.peer.read().clone()
    }

    /// Fail unless the peer declared `capability` during the handshake.
    pub fn require_peer_capability(&self, capability: &str) -> SessionResult<()> {
        let peer = self.inner.peer.read();
        match peer.as_ref() {
            Some(info) if info.capabilities.supports(capability) => Ok(()),
            Some(_) => Err(SessionError::CapabilityNotSupported(capability.to_string())),
            None => Err(SessionError::NotReady),
        }
    }

    /// Tear the session down: fail outstanding requests, cancel and join
    /// handler tasks, dispose the transport. Idempotent and thread-safe.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }

    /// Wait until the session is fully disposed.
    pub async fn closed(&self) {
        self.inner.state.wait_for(SessionState::Disposed).await;
    }
}

impl SessionInner {
    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    fn check_send_allowed(&self, method: &str, is_request: bool) -> SessionResult<()> {
        match self.state.get() {
            SessionState::Ready => Ok(()),
            SessionState::Disposing | SessionState::Disposed => Err(SessionError::Disposed),
            SessionState::HandshakePending => {
                let allowed = if is_request {
                    method == methods::INITIALIZE
                } else {
                    method == methods::INITIALIZED
                        || methods::is_cancelled(method)
                        || methods::is_progress(method)
                        || (method == methods::LOG_MESSAGE && self.logging_allowed_pre_ready())
                };
                if allowed { Ok(()) } else { Err(SessionError::NotReady) }
            }
            SessionState::Created | SessionState::Connecting => Err(SessionError::NotReady),
        }
    }

    fn logging_allowed_pre_ready(&self) -> bool {
        self.config.capabilities.supports_logging()
            && self
                .peer
                .read()
                .as_ref()
                .is_some_and(|p| p.capabilities.supports_logging())
    }

    async fn send_request(
        self: &Arc<Self>,
        method: &str,
        mut params: Option<Value>,
        options: RequestOptions,
    ) -> SessionResult<Value> {
        self.check_send_allowed(method, true)?;

        let id = self.allocator.next();
        let progress_token = options.progress.map(|sink| {
            let token = self.progress.mint();
            self.progress.register(token.clone(), sink);
            token
        });
        if let Some(token) = &progress_token {
            meta::set_progress_token(&mut params, token);
        }
        if let Some(tc) = self.observer.current_trace_context() {
            meta::set_trace_context(&mut params, &tc.traceparent, tc.tracestate.as_deref());
        }

        let (completer, mut receiver) = oneshot::channel();
        let insert = self.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                completer,
                progress_token: progress_token.clone(),
            },
        );
        if let Err(e) = insert {
            if let Some(token) = &progress_token {
                self.progress.deregister(token);
            }
            return Err(e);
        }

        let cancel = options.cancellation.unwrap_or_default();
        let started = Instant::now();
        let request = Request::new(method, params, id.clone());

        if let Err(e) = self
            .transport
            .send_cancellable(Message::Request(request), &cancel)
            .await
        {
            self.pending.discard(&id);
            if let Some(token) = &progress_token {
                self.progress.deregister(token);
            }
            let err = match e {
                fluxmcp_transport::TransportError::Cancelled => SessionError::Cancelled,
                other => SessionError::Transport(other),
            };
            self.observer
                .operation_completed(method, err.outcome(), started.elapsed());
            return Err(err);
        }

        let deadline = async {
            match options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            // A reply that already arrived wins over a racing cancellation.
            biased;
            result = &mut receiver => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(SessionError::TransportClosed),
            },
            () = cancel.cancelled() => {
                self.abort_outgoing(&id, Some("cancelled")).await;
                Err(SessionError::Cancelled)
            }
            () = deadline => {
                self.abort_outgoing(&id, Some("timeout")).await;
                Err(SessionError::Cancelled)
            }
        };

        if let Some(token) = &progress_token {
            self.progress.deregister(token);
        }
        let label = match &outcome {
            Ok(_) => "success",
            Err(e) => e.outcome(),
        };
        self.observer
            .operation_completed(method, label, started.elapsed());
        outcome
    }

    /// Retire a locally-abandoned request and tell the peer, best-effort.
    async fn abort_outgoing(&self, id: &RequestId, reason: Option<&str>) {
        if self.pending.discard(id).is_none() {
            return;
        }
        let params = CancelledParams {
            request_id: id.clone(),
            reason: reason.map(String::from),
        };
        match Notification::with_params(methods::CANCELLED, params) {
            Ok(notification) => {
                if let Err(e) = self.transport.send(Message::Notification(notification)).await {
                    debug!(error = %e, id = %id, "cancellation notification dropped");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize cancellation params"),
        }
    }

    async fn send_notification(
        self: &Arc<Self>,
        method: &str,
        mut params: Option<Value>,
    ) -> SessionResult<()> {
        self.check_send_allowed(method, false)?;
        // The logging notification is deliberately not instrumented.
        if method != methods::LOG_MESSAGE
            && let Some(tc) = self.observer.current_trace_context()
        {
            meta::set_trace_context(&mut params, &tc.traceparent, tc.tracestate.as_deref());
        }
        let started = Instant::now();
        let result = self
            .transport
            .send(Message::Notification(Notification::new(method, params)))
            .await;
        match result {
            Ok(()) => {
                if method != methods::LOG_MESSAGE {
                    self.observer
                        .operation_completed(method, "sent", started.elapsed());
                }
                Ok(())
            }
            Err(e) => Err(SessionError::Transport(e)),
        }
    }

    async fn send_log_message(
        self: &Arc<Self>,
        level: LoggingLevel,
        logger: Option<&str>,
        data: Value,
    ) -> SessionResult<()> {
        if level < *self.min_log_level.read() {
            return Ok(());
        }
        if self.state.get() == SessionState::Ready {
            // Post-handshake the peer's declared capabilities gate logging.
            let supported = self
                .peer
                .read()
                .as_ref()
                .is_some_and(|p| p.capabilities.supports_logging());
            if !supported {
                return Err(SessionError::CapabilityNotSupported(
                    fluxmcp_protocol::types::capability_keys::LOGGING.to_string(),
                ));
            }
        }
        let params = LoggingMessageParams {
            level,
            logger: logger.map(String::from),
            data,
        };
        self.send_notification(methods::LOG_MESSAGE, Some(serde_json::to_value(&params)?))
            .await
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    async fn run_dispatch(inner: Arc<Self>) {
        debug!(role = ?inner.config.role, "dispatch loop started");
        let reason = loop {
            let received = tokio::select! {
                () = inner.shutdown.cancelled() => break "disposed",
                received = inner.transport.receive() => received,
            };
            match received {
                Ok(Some(message)) => {
                    for item in message.into_messages() {
                        inner.route(item).await;
                    }
                }
                Ok(None) => break "peer_closed",
                Err(e) => {
                    warn!(error = %e, "transport fault; dispatch loop exiting");
                    break "transport_fault";
                }
            }
        };
        debug!(reason, "dispatch loop exited");

        inner.state.begin_disposing();
        inner.shutdown.cancel();
        for token in inner.pending.fail_all_closed() {
            inner.progress.deregister(&token);
        }
        inner.transport.dispose().await;
        inner.finalize().await;
    }

    async fn route(self: &Arc<Self>, message: Message) {
        match message {
            Message::Response(response) => self.handle_response(response),
            Message::Request(request) => self.handle_request(request).await,
            Message::Notification(notification) => self.handle_notification(notification),
            // `into_messages` flattened batches already.
            Message::Batch(_) => unreachable!("batches are flattened before routing"),
        }
    }

    fn handle_response(&self, response: Response) {
        let Some(id) = response.id.as_request_id().cloned() else {
            warn!("dropping response with null id");
            return;
        };
        let outcome = match response.payload {
            fluxmcp_protocol::ResponsePayload::Success { result } => Ok(result),
            fluxmcp_protocol::ResponsePayload::Error { error } => {
                Err(SessionError::Protocol(error.into()))
            }
        };
        match self.pending.complete(&id, outcome) {
            Some(Some(token)) => self.progress.deregister(&token),
            Some(None) => {}
            None => warn!(id = %id, "dropping response for unknown or retired id"),
        }
    }

    async fn handle_request(self: &Arc<Self>, request: Request) {
        if request.method == methods::INITIALIZE {
            self.handle_initialize(request).await;
            return;
        }
        if self.state.get() < SessionState::Ready {
            // Nothing may be answered before the handshake completes.
            warn!(method = %request.method, "dropping request received before handshake completed");
            return;
        }

        match request.method.as_str() {
            methods::PING => {
                let reply = Response::success(
                    request.id,
                    serde_json::to_value(EmptyResult::default()).unwrap_or(Value::Object(
                        serde_json::Map::new(),
                    )),
                );
                self.send_reply(reply).await;
            }
            methods::SET_LEVEL => {
                let reply = match serde_json::from_value::<SetLevelParams>(
                    request.params.unwrap_or(Value::Null),
                ) {
                    Ok(params) => {
                        *self.min_log_level.write() = params.level;
                        Response::success(request.id, Value::Object(serde_json::Map::new()))
                    }
                    Err(e) => Response::error(
                        request.id,
                        ErrorObject::invalid_params(&e.to_string()),
                    ),
                };
                self.send_reply(reply).await;
            }
            _ => self.spawn_handler(request).await,
        }
    }

    async fn spawn_handler(self: &Arc<Self>, request: Request) {
        let Some(handler) = self.registry.request_handler(&request.method) else {
            let reply = Response::error(
                request.id,
                ErrorObject::method_not_found(&request.method),
            );
            self.send_reply(reply).await;
            return;
        };

        if let Some(tc) = extract_trace_context(request.params.as_ref()) {
            self.observer.inbound_trace_context(&request.method, &tc);
        }

        let id = request.id.clone();
        let token = self.shutdown.child_token();
        self.inflight.insert(id.clone(), token.clone());

        let context = RequestContext::new(
            request.method.clone(),
            request.params,
            token.clone(),
            Arc::clone(&self.transport),
        );
        let inner = Arc::clone(self);
        let method = request.method;
        self.tracker.spawn(async move {
            let started = Instant::now();
            let work = std::panic::AssertUnwindSafe(handler(context)).catch_unwind();
            tokio::pin!(work);

            // Exactly one decision: a result that lands first is replied to
            // even if cancellation fires immediately after; a cancellation
            // that lands first suppresses the reply entirely.
            let decision = tokio::select! {
                () = token.cancelled() => None,
                outcome = &mut work => Some(outcome),
            };
            inner.inflight.remove(&id);

            let label = match decision {
                None => {
                    debug!(method = %method, id = %id, "handler cancelled; no reply sent");
                    "cancelled"
                }
                Some(Ok(Ok(value))) => {
                    inner.send_reply(Response::success(id, value)).await;
                    "success"
                }
                Some(Ok(Err(protocol_error))) => {
                    inner
                        .send_reply(Response::error(id, protocol_error.into()))
                        .await;
                    "handler_error"
                }
                Some(Err(_panic)) => {
                    // Panic payloads never reach the wire.
                    inner
                        .send_reply(Response::error(
                            id,
                            ErrorObject::new(error_codes::INTERNAL_ERROR, "Internal error"),
                        ))
                        .await;
                    "handler_panic"
                }
            };
            inner
                .observer
                .operation_completed(&method, label, started.elapsed());
        });
    }

    async fn handle_initialize(self: &Arc<Self>, request: Request) {
        if self.config.role != EndpointRole::Server {
            warn!("client endpoint received an initialize request; dropping");
            return;
        }
        if self.state.get() >= SessionState::Ready {
            let reply = Response::error(
                request.id,
                ErrorObject::new(error_codes::INVALID_REQUEST, "initialize already completed"),
            );
            self.send_reply(reply).await;
            return;
        }

        let params = match serde_json::from_value::<InitializeRequestParams>(
            request.params.unwrap_or(Value::Null),
        ) {
            Ok(params) => params,
            Err(e) => {
                let reply =
                    Response::error(request.id, ErrorObject::invalid_params(&e.to_string()));
                self.send_reply(reply).await;
                return;
            }
        };

        let version = handshake::responder_version(&params.protocol_version);
        *self.peer.write() = Some(PeerInfo {
            protocol_version: version.to_string(),
            capabilities: params.capabilities,
            implementation: params.client_info,
        });

        let result = InitializeResult {
            protocol_version: version.to_string(),
            capabilities: self.config.capabilities.clone(),
            server_info: self.config.info.clone(),
            instructions: self.config.instructions.clone(),
        };
        match serde_json::to_value(&result) {
            Ok(value) => self.send_reply(Response::success(request.id, value)).await,
            Err(e) => warn!(error = %e, "failed to serialize initialize result"),
        }
    }

    fn handle_notification(self: &Arc<Self>, notification: Notification) {
        if methods::is_cancelled(&notification.method) {
            match serde_json::from_value::<CancelledParams>(
                notification.params.unwrap_or(Value::Null),
            ) {
                Ok(params) => {
                    // Trip the in-flight handler; its task suppresses the
                    // reply. No acknowledgement is sent.
                    if let Some(entry) = self.inflight.get(&params.request_id) {
                        debug!(id = %params.request_id, reason = ?params.reason, "peer cancelled in-flight request");
                        entry.value().cancel();
                    } else {
                        trace!(id = %params.request_id, "cancellation for unknown request id");
                    }
                }
                Err(e) => warn!(error = %e, "malformed cancellation notification"),
            }
            return;
        }

        if methods::is_progress(&notification.method) {
            match serde_json::from_value::<ProgressParams>(
                notification.params.unwrap_or(Value::Null),
            ) {
                Ok(params) => {
                    if !self.progress.route(params) {
                        trace!("progress update without a registered sink; dropped");
                    }
                }
                Err(e) => warn!(error = %e, "malformed progress notification"),
            }
            return;
        }

        if notification.method == methods::INITIALIZED {
            if self.config.role == EndpointRole::Server
                && self.state.get() == SessionState::HandshakePending
            {
                debug!("initialized received; session ready");
                self.state.advance(SessionState::Ready);
            }
            // Registered handlers still observe the notification below.
        }

        if notification.method != methods::LOG_MESSAGE
            && let Some(tc) = extract_trace_context(notification.params.as_ref())
        {
            self.observer
                .inbound_trace_context(&notification.method, &tc);
        }

        // Snapshot at arrival time: a handler registered after this point
        // is not invoked for this notification.
        let handlers = self.registry.notification_handlers(&notification.method);
        if handlers.is_empty() {
            trace!(method = %notification.method, "notification without handlers");
            return;
        }
        self.enqueue_notification(notification, handlers);
    }

    /// Queue a notification onto its per-method worker, preserving
    /// transport-arrival order for that method without blocking dispatch.
    fn enqueue_notification(
        self: &Arc<Self>,
        notification: Notification,
        handlers: Vec<NotificationHandler>,
    ) {
        let sender = self
            .notify_queues
            .entry(notification.method.clone())
            .or_insert_with(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<NotificationJob>();
                let shutdown = self.shutdown.clone();
                self.tracker.spawn(async move {
                    loop {
                        let job = tokio::select! {
                            () = shutdown.cancelled() => break,
                            job = rx.recv() => job,
                        };
                        let Some((notification, handlers)) = job else {
                            break;
                        };
                        for handler in handlers {
                            let fut = std::panic::AssertUnwindSafe(handler(notification.clone()))
                                .catch_unwind();
                            if fut.await.is_err() {
                                warn!(method = %notification.method, "notification handler panicked");
                            }
                        }
                    }
                });
                tx
            })
            .clone();
        let _ = sender.send((notification, handlers));
    }

    async fn send_reply(&self, reply: Response) {
        if let Err(e) = self.transport.send(Message::Response(reply)).await {
            warn!(error = %e, "failed to send reply");
        }
    }

    // ------------------------------------------------------------------
    // Disposal
    // ------------------------------------------------------------------

    async fn dispose(self: &Arc<Self>) {
        let won = self.state.begin_disposing();
        self.shutdown.cancel();

        if !self.dispatch_started.load(Ordering::SeqCst) {
            // No loop to unwind; finish teardown directly.
            if won {
                for token in self.pending.fail_all_closed() {
                    self.progress.deregister(&token);
                }
                self.transport.dispose().await;
                self.finalize().await;
            } else {
                self.state.wait_for(SessionState::Disposed).await;
            }
            return;
        }

        // The dispatch loop observes the shutdown token (or the disposed
        // transport), fails outstanding requests, and finalizes.
        self.transport.dispose().await;
        self.state.wait_for(SessionState::Disposed).await;
    }

    async fn finalize(self: &Arc<Self>) {
        let mut finalized = self.finalized.lock().await;
        if *finalized {
            return;
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.state.set_disposed();
        self.observer.session_count_changed(-1);
        *finalized = true;
        debug!("session disposed");
    }
}

/// Pull `traceparent`/`tracestate` out of inbound params.
fn extract_trace_context(params: Option<&Value>) -> Option<TraceContext> {
    let meta = fluxmcp_protocol::RequestMeta::from_params(params)?;
    let traceparent = meta.traceparent?;
    Some(TraceContext {
        traceparent,
        tracestate: meta.tracestate,
    })
}
