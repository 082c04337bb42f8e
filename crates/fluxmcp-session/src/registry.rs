//! Handler registration tables and the per-request context.
//!
//! Two tables per session: at most one request handler per method
//! (re-registration replaces) and any number of notification handlers per
//! method, invoked in registration order. Both tables may be mutated
//! mid-session; a handler registered while a matching message is already in
//! flight is not invoked for that message: the dispatch loop snapshots the
//! table at arrival time.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use fluxmcp_protocol::{
    Message, Notification, ProgressParams, ProgressToken, ProtocolError, RequestMeta, methods,
};
use fluxmcp_transport::Transport;

/// Future returned by request handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, ProtocolError>> + Send>>;

/// Handler for one incoming request method.
///
/// Runs on its own spawned task; the dispatch loop never awaits it.
/// Returning `Err` produces an error reply with the carried code verbatim.
pub type RequestHandler = Arc<dyn Fn(RequestContext) -> HandlerFuture + Send + Sync>;

/// Future returned by notification handlers.
pub type NotificationFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handler for one incoming notification method.
pub type NotificationHandler = Arc<dyn Fn(Notification) -> NotificationFuture + Send + Sync>;

/// Box an async closure into a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProtocolError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Box an async closure into a [`NotificationHandler`].
pub fn notification_handler<F, Fut>(f: F) -> NotificationHandler
where
    F: Fn(Notification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |n| Box::pin(f(n)))
}

/// Context handed to a request handler.
pub struct RequestContext {
    /// Method name of the request
    pub method: String,
    /// Raw request params
    pub params: Option<Value>,
    /// Tripped on peer cancellation, session disposal, or handshake timeout
    pub cancellation: CancellationToken,
    reporter: ProgressReporter,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    pub(crate) fn new(
        method: String,
        params: Option<Value>,
        cancellation: CancellationToken,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let token = fluxmcp_protocol::meta::progress_token_of(params.as_ref());
        Self {
            method,
            params,
            cancellation,
            reporter: ProgressReporter { transport, token },
        }
    }

    /// Deserialize the params into a concrete type.
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = self.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| ProtocolError::invalid_params(e.to_string()))
    }

    /// The request's `_meta`, if any.
    pub fn meta(&self) -> Option<RequestMeta> {
        RequestMeta::from_params(self.params.as_ref())
    }

    /// Emit a progress notification correlated to this request.
    ///
    /// No-op when the requester did not supply a progress token. Delivery
    /// is best-effort; transport faults are logged and swallowed.
    pub async fn report_progress(&self, progress: f64, total: Option<f64>, message: Option<&str>) {
        self.reporter.report(progress, total, message).await;
    }
}

/// Sends progress updates back to the requester.
struct ProgressReporter {
    transport: Arc<dyn Transport>,
    token: Option<ProgressToken>,
}

impl ProgressReporter {
    async fn report(&self, progress: f64, total: Option<f64>, message: Option<&str>) {
        let Some(token) = &self.token else { return };
        let params = ProgressParams {
            progress_token: token.clone(),
            progress,
            total,
            message: message.map(String::from),
        };
        let notification = match Notification::with_params(methods::PROGRESS, params) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize progress params");
                return;
            }
        };
        if let Err(e) = self.transport.send(Message::Notification(notification)).await {
            tracing::debug!(error = %e, "progress notification dropped");
        }
    }
}

/// Handle returned by a registration; consumes itself to unregister.
///
/// Dropping the handle leaves the handler registered for the life of the
/// session.
#[derive(Debug)]
pub struct Registration {
    method: String,
    id: u64,
    kind: RegistrationKind,
    registry: Weak<HandlerRegistry>,
}

#[derive(Debug, Clone, Copy)]
enum RegistrationKind {
    Request,
    Notification,
}

impl Registration {
    /// Remove the handler this registration installed.
    pub fn unregister(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match self.kind {
            RegistrationKind::Request => {
                let mut requests = registry.requests.write();
                // Only remove if this registration still owns the slot.
                if requests.get(&self.method).is_some_and(|(id, _)| *id == self.id) {
                    requests.remove(&self.method);
                }
            }
            RegistrationKind::Notification => {
                let mut notifications = registry.notifications.write();
                if let Some(handlers) = notifications.get_mut(&self.method) {
                    handlers.retain(|(id, _)| *id != self.id);
                    if handlers.is_empty() {
                        notifications.remove(&self.method);
                    }
                }
            }
        }
    }
}

/// The per-session handler tables.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    requests: RwLock<HashMap<String, (u64, RequestHandler)>>,
    notifications: RwLock<HashMap<String, Vec<(u64, NotificationHandler)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("request_methods", &self.requests.read().len())
            .field("notification_methods", &self.notifications.read().len())
            .finish()
    }
}

impl HandlerRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install the request handler for a method, replacing any previous one.
    pub(crate) fn register_request(
        self: &Arc<Self>,
        method: &str,
        handler: RequestHandler,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.requests
            .write()
            .insert(method.to_string(), (id, handler));
        Registration {
            method: method.to_string(),
            id,
            kind: RegistrationKind::Request,
            registry: Arc::downgrade(self),
        }
    }

    /// Append a notification handler for a method.
    pub(crate) fn register_notification(
        self: &Arc<Self>,
        method: &str,
        handler: NotificationHandler,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.notifications
            .write()
            .entry(method.to_string())
            .or_default()
            .push((id, handler));
        Registration {
            method: method.to_string(),
            id,
            kind: RegistrationKind::Notification,
            registry: Arc::downgrade(self),
        }
    }

    /// Snapshot the request handler for a method at message-arrival time.
    pub(crate) fn request_handler(&self, method: &str) -> Option<RequestHandler> {
        self.requests.read().get(method).map(|(_, h)| Arc::clone(h))
    }

    /// Snapshot the notification handlers for a method, in registration
    /// order, at message-arrival time.
    pub(crate) fn notification_handlers(&self, method: &str) -> Vec<NotificationHandler> {
        self.notifications
            .read()
            .get(method)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }
}
