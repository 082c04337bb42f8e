//! Streamable HTTP server.
//!
//! One axum endpoint serves the whole transport:
//!
//! - `POST` carries one JSON-RPC message or a batch. No requests in the
//!   body → `202 Accepted`. Requests present → either a buffered
//!   `application/json` reply or a `text/event-stream` sub-stream that
//!   closes once every request id in the body has been answered.
//! - `GET` opens the long-lived SSE stream for server-initiated traffic,
//!   resumable with `Last-Event-ID`.
//! - `DELETE` tears the session down.
//!
//! The POST carrying `initialize` mints the session id; every other
//! request must echo it in `mcp-session-id` or is answered `404`.

use std::io;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::post;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use fluxmcp_protocol::{
    InitializeRequestParams, Message, Notification, Request, RequestId, Response, codec, methods,
};
use fluxmcp_session::{Session, SessionConfig};

use crate::config::{ResponseMode, StreamableHttpConfig};
use crate::distributed::{DistributedSessions, RouteDecision};
use crate::session::{
    HttpServerSession, LAST_EVENT_ID_HEADER, MAX_SESSION_ID_LEN, SESSION_ID_HEADER, SessionSetup,
    decode_stateless_id, encode_stateless_id, mint_session_id,
};
use crate::sse::keep_alive_frame;

/// The Streamable HTTP server for one MCP endpoint.
///
/// Every logical session gets its own [`Session`] engine, wired by the
/// setup callback given at construction.
pub struct StreamableHttpServer {
    config: StreamableHttpConfig,
    session_template: SessionConfig,
    setup: SessionSetup,
    sessions: DashMap<String, Arc<HttpServerSession>>,
    distributed: Option<DistributedSessions>,
}

impl std::fmt::Debug for StreamableHttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServer")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .field("distributed", &self.distributed.is_some())
            .finish_non_exhaustive()
    }
}

impl StreamableHttpServer {
    /// Create a server. `setup` runs once per new logical session to
    /// register its handlers.
    pub fn new(
        config: StreamableHttpConfig,
        session_template: SessionConfig,
        setup: impl Fn(&Session) + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            session_template,
            setup: Arc::new(setup),
            sessions: DashMap::new(),
            distributed: None,
        }
    }

    /// Enable multi-node routing through a shared owner cache.
    pub fn with_distributed(mut self, distributed: DistributedSessions) -> Self {
        self.distributed = Some(distributed);
        self
    }

    /// A live session record, e.g. to issue server-initiated requests
    /// through its engine.
    pub fn session(&self, id: &str) -> Option<Arc<HttpServerSession>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Ids of every live session on this node.
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Build the axum router for this server.
    pub fn router(self: Arc<Self>) -> Router {
        let limit = self.config.max_body_bytes;
        let path = self.config.endpoint_path.clone();
        Router::new()
            .route(
                &path,
                post(post_handler).get(get_handler).delete(delete_handler),
            )
            .layer(DefaultBodyLimit::max(limit))
            .with_state(self)
    }

    /// Serve on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let router = Arc::new(self).router();
        axum::serve(listener, router).await
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<HttpServerSession>> {
        let session = self.session(session_id)?;
        if session.idle_for() > self.config.session_idle_timeout {
            debug!(session_id, "expiring idle session");
            self.sessions.remove(session_id);
            let stale = Arc::clone(&session);
            tokio::spawn(async move { stale.dispose().await });
            return None;
        }
        Some(session)
    }
}

type ServerState = State<Arc<StreamableHttpServer>>;

fn accepts(headers: &HeaderMap, content_type: &str) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains(content_type) || accept.contains("*/*"))
}

fn session_header(headers: &HeaderMap) -> Result<Option<String>, AxumResponse> {
    match headers.get(SESSION_ID_HEADER) {
        None => Ok(None),
        Some(value) => match value.to_str() {
            Ok(id) if id.len() <= MAX_SESSION_ID_LEN => Ok(Some(id.to_string())),
            _ => Err(StatusCode::NOT_FOUND.into_response()),
        },
    }
}

fn session_id_headers(session_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(session_id) {
        headers.insert(SESSION_ID_HEADER, value);
    }
    headers
}

fn contains_initialize(message: &Message) -> bool {
    match message {
        Message::Request(request) => request.method == methods::INITIALIZE,
        Message::Batch(items) => items.iter().any(contains_initialize),
        Message::Response(_) | Message::Notification(_) => false,
    }
}

fn initialize_params(message: &Message) -> Option<InitializeRequestParams> {
    match message {
        Message::Request(request) if request.method == methods::INITIALIZE => {
            serde_json::from_value(request.params.clone()?).ok()
        }
        Message::Batch(items) => items.iter().find_map(initialize_params),
        _ => None,
    }
}

async fn post_handler(
    State(server): ServerState,
    headers: HeaderMap,
    body: Bytes,
) -> AxumResponse {
    // Clients must be able to take either reply shape.
    if !accepts(&headers, "application/json") || !accepts(&headers, "text/event-stream") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    let session_id = match session_header(&headers) {
        Ok(id) => id,
        Err(response) => return response,
    };

    if let (Some(distributed), Some(sid)) = (&server.distributed, &session_id)
        && !server.config.stateless
    {
        match distributed.route(sid).await {
            RouteDecision::Local => {}
            RouteDecision::Forward(base_url) => {
                return distributed
                    .forward(
                        &base_url,
                        &server.config.endpoint_path,
                        Method::POST,
                        &headers,
                        body,
                        sid,
                    )
                    .await;
            }
            RouteDecision::Expired => return StatusCode::NOT_FOUND.into_response(),
        }
    }

    let message = match codec::decode_bytes(&body) {
        Ok(message) => message,
        Err(e) => {
            let reply = Response::parse_error(format!("invalid JSON-RPC payload: {e}"));
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::to_value(&reply).unwrap_or_default()),
            )
                .into_response();
        }
    };

    if server.config.stateless {
        return post_stateless(&server, session_id, message).await;
    }
    if contains_initialize(&message) {
        return post_initialize(&server, message).await;
    }

    // A POST without a session id that is not an initialize is rejected.
    let Some(sid) = session_id else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(session) = server.lookup(&sid) else {
        if let Some(distributed) = &server.distributed {
            distributed.release(&sid).await;
        }
        return StatusCode::NOT_FOUND.into_response();
    };
    session.touch();
    respond_to_post(&server, session, message, false).await
}

async fn post_initialize(
    server: &Arc<StreamableHttpServer>,
    message: Message,
) -> AxumResponse {
    let session_id = mint_session_id();
    let session = HttpServerSession::start(
        session_id.clone(),
        server.session_template.clone(),
        &server.config,
        &server.setup,
    );
    server.sessions.insert(session_id.clone(), Arc::clone(&session));
    if let Some(distributed) = &server.distributed {
        distributed.claim_new(&session_id).await;
    }
    debug!(session_id, "session established");
    respond_to_post(server, session, message, false).await
}

async fn post_stateless(
    server: &Arc<StreamableHttpServer>,
    session_id: Option<String>,
    message: Message,
) -> AxumResponse {
    if contains_initialize(&message) {
        let Some(params) = initialize_params(&message) else {
            let reply = Response::parse_error("initialize params missing or malformed");
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::to_value(&reply).unwrap_or_default()),
            )
                .into_response();
        };
        let Ok(session_id) = encode_stateless_id(&params) else {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };
        let session = HttpServerSession::start(
            session_id,
            server.session_template.clone(),
            &server.config,
            &server.setup,
        );
        return respond_to_post(server, session, message, true).await;
    }

    // Later POSTs reconstruct the negotiated view from the session id.
    let Some(sid) = session_id else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(params) = decode_stateless_id(&sid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let session = HttpServerSession::start(
        sid,
        server.session_template.clone(),
        &server.config,
        &server.setup,
    );

    // Replay the handshake so the engine reaches Ready before the real
    // traffic; the bootstrap reply never leaves this node.
    let bootstrap_id = RequestId::String(format!("bootstrap-{}", uuid::Uuid::new_v4().simple()));
    let swallow = session.router().open_sub_stream(vec![bootstrap_id.clone()]);
    drop(swallow);
    match Request::with_params(methods::INITIALIZE, params, bootstrap_id) {
        Ok(request) => {
            session.router().inject(request.into());
        }
        Err(e) => {
            warn!(error = %e, "failed to rebuild stateless handshake");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    session
        .router()
        .inject(Notification::new(methods::INITIALIZED, None).into());

    respond_to_post(server, session, message, true).await
}

async fn respond_to_post(
    server: &Arc<StreamableHttpServer>,
    session: Arc<HttpServerSession>,
    message: Message,
    ephemeral: bool,
) -> AxumResponse {
    let ids = message.request_ids();
    let was_batch = matches!(message, Message::Batch(_));
    let response_headers = session_id_headers(&session.id);

    if ids.is_empty() {
        session.router().inject(message);
        if ephemeral {
            tokio::spawn(async move { session.dispose().await });
        }
        return (StatusCode::ACCEPTED, response_headers).into_response();
    }

    // The sub-stream must exist before the engine can produce replies.
    let mut replies = session.router().open_sub_stream(ids);
    session.router().inject(message);

    match server.config.response_mode {
        ResponseMode::Json => {
            let mut responses = Vec::new();
            while let Some(event) = replies.recv().await {
                match codec::decode(&event.data) {
                    Ok(Message::Response(_)) => match serde_json::from_str(&event.data) {
                        Ok(value) => responses.push(value),
                        Err(e) => warn!(error = %e, "unparseable reply event"),
                    },
                    // Notifications have nowhere to go in JSON mode.
                    Ok(_) => debug!("discarding non-reply event in JSON response mode"),
                    Err(e) => warn!(error = %e, "unparseable event on sub-stream"),
                }
            }
            if ephemeral {
                session.dispose().await;
            }
            let payload = if was_batch {
                serde_json::Value::Array(responses)
            } else {
                responses.pop().unwrap_or_default()
            };
            (StatusCode::OK, response_headers, axum::Json(payload)).into_response()
        }
        ResponseMode::Sse => {
            let body = async_stream::stream! {
                while let Some(event) = replies.recv().await {
                    yield Ok::<Bytes, io::Error>(Bytes::from(event.to_frame()));
                }
                if ephemeral {
                    session.dispose().await;
                }
            };
            let mut headers = response_headers;
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            (StatusCode::OK, headers, Body::from_stream(body)).into_response()
        }
    }
}

async fn get_handler(State(server): ServerState, headers: HeaderMap) -> AxumResponse {
    if server.config.stateless {
        // No server-initiated traffic exists without session state.
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if !accepts(&headers, "text/event-stream") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    let session_id = match session_header(&headers) {
        Ok(Some(id)) => id,
        Ok(None) => return StatusCode::BAD_REQUEST.into_response(),
        Err(response) => return response,
    };

    if let Some(distributed) = &server.distributed {
        match distributed.route(&session_id).await {
            RouteDecision::Local => {}
            RouteDecision::Forward(base_url) => {
                return distributed
                    .forward(
                        &base_url,
                        &server.config.endpoint_path,
                        Method::GET,
                        &headers,
                        Bytes::new(),
                        &session_id,
                    )
                    .await;
            }
            RouteDecision::Expired => return StatusCode::NOT_FOUND.into_response(),
        }
    }

    let Some(session) = server.lookup(&session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    session.touch();

    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let mut events = session.router().attach_get_stream(last_event_id);

    let keep_alive = server.config.keep_alive;
    let body = async_stream::stream! {
        let mut ticker = tokio::time::interval(keep_alive);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => yield Ok::<Bytes, io::Error>(Bytes::from(event.to_frame())),
                    None => break,
                },
                _ = ticker.tick() => {
                    yield Ok(Bytes::from(keep_alive_frame()));
                }
            }
        }
    };

    let mut response_headers = session_id_headers(&session.id);
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    (StatusCode::OK, response_headers, Body::from_stream(body)).into_response()
}

async fn delete_handler(State(server): ServerState, headers: HeaderMap) -> AxumResponse {
    if server.config.stateless {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let session_id = match session_header(&headers) {
        Ok(Some(id)) => id,
        Ok(None) => return StatusCode::BAD_REQUEST.into_response(),
        Err(response) => return response,
    };

    if let Some(distributed) = &server.distributed {
        match distributed.route(&session_id).await {
            RouteDecision::Local => {}
            RouteDecision::Forward(base_url) => {
                return distributed
                    .forward(
                        &base_url,
                        &server.config.endpoint_path,
                        Method::DELETE,
                        &headers,
                        Bytes::new(),
                        &session_id,
                    )
                    .await;
            }
            RouteDecision::Expired => return StatusCode::NOT_FOUND.into_response(),
        }
    }

    let Some((_, session)) = server.sessions.remove(&session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(distributed) = &server.distributed {
        distributed.release(&session_id).await;
    }
    session.dispose().await;
    debug!(session_id, "session terminated by client");
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_header_matching() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        assert!(accepts(&headers, "application/json"));
        assert!(accepts(&headers, "text/event-stream"));
        assert!(!accepts(&headers, "application/xml"));

        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        assert!(accepts(&headers, "text/event-stream"));
    }

    #[test]
    fn over_long_session_ids_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SESSION_ID_HEADER,
            HeaderValue::from_str(&"x".repeat(MAX_SESSION_ID_LEN + 1)).unwrap(),
        );
        assert!(session_header(&headers).is_err());
    }

    #[test]
    fn initialize_detection_reaches_into_batches() {
        let init = Request::new("initialize", None, RequestId::Number(1));
        assert!(contains_initialize(&init.clone().into()));
        let batch = Message::Batch(vec![
            Notification::new("x", None).into(),
            init.into(),
        ]);
        assert!(contains_initialize(&batch));
        assert!(!contains_initialize(
            &Notification::new("initialize", None).into()
        ));
    }
}
