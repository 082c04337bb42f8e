//! # fluxmcp-session
//!
//! The duplex session engine: request/response correlation, handler
//! dispatch, the initialize handshake, progress and cancellation plumbing,
//! and orderly teardown.
//!
//! A [`Session`] wraps any [`fluxmcp_transport::Transport`]. Both peers are
//! symmetric JSON-RPC endpoints; the [`EndpointRole`] only decides who
//! drives the handshake.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fluxmcp_protocol::Implementation;
//! use fluxmcp_session::{Session, SessionConfig, request_handler};
//! use fluxmcp_transport::StdioTransport;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new(
//!     StdioTransport::new(),
//!     SessionConfig::server(Implementation::new("example", "1.0.0")),
//! );
//! session.register_request_handler(
//!     "echo",
//!     request_handler(|ctx| async move {
//!         Ok(ctx.params.unwrap_or(serde_json::Value::Null))
//!     }),
//! );
//! session.start();
//! session.closed().await;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

mod allocator;
mod diagnostics;
mod engine;
mod error;
mod handshake;
mod lifecycle;
mod pending;
mod progress;
mod registry;

pub use diagnostics::{
    DURATION_BUCKETS_SECONDS, MetricsObserver, NullObserver, SessionObserver, TraceContext,
    describe_metrics,
};
pub use engine::{EndpointRole, RequestOptions, Session, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use handshake::PeerInfo;
pub use lifecycle::SessionState;
pub use progress::ProgressSink;
pub use registry::{
    HandlerFuture, NotificationFuture, NotificationHandler, Registration, RequestContext,
    RequestHandler, notification_handler, request_handler,
};
