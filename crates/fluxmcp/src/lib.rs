//! # fluxmcp
//!
//! Duplex [Model Context Protocol](https://modelcontextprotocol.io)
//! sessions for Rust. This facade re-exports the full stack:
//!
//! - [`protocol`]: JSON-RPC 2.0 wire algebra, `_meta`, handshake types
//! - [`transport`]: the `Transport` trait plus stdio, child-process, TCP,
//!   and in-memory transports
//! - [`session`]: the duplex session engine
//! - [`streamable`]: the Streamable HTTP transport (server and client)
//!
//! Most applications only need the [`prelude`]:
//!
//! ```rust,no_run
//! use fluxmcp::prelude::*;
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

pub use fluxmcp_protocol as protocol;
pub use fluxmcp_session as session;
pub use fluxmcp_streamable as streamable;
pub use fluxmcp_transport as transport;

/// The most commonly used surface, in one import.
pub mod prelude {
    pub use fluxmcp_protocol::{
        Capabilities, ErrorObject, Implementation, Message, Notification, ProgressParams,
        ProgressToken, ProtocolError, Request, RequestId, Response,
    };
    pub use fluxmcp_session::{
        EndpointRole, RequestContext, RequestOptions, Session, SessionConfig, SessionError,
        SessionResult, SessionState, notification_handler, request_handler,
    };
    pub use fluxmcp_streamable::{
        StreamableHttpClient, StreamableHttpConfig, StreamableHttpConfigBuilder,
        StreamableHttpServer,
    };
    pub use fluxmcp_transport::{
        ChildProcessTransport, MemoryTransport, StdioTransport, TcpTransport, Transport,
        TransportError,
    };
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use fluxmcp_transport::memory;

    #[tokio::test]
    async fn prelude_covers_a_whole_round_trip() {
        let (client_side, server_side) = memory::pair();
        let client = Session::new(
            client_side,
            SessionConfig::client(Implementation::new("t", "0")),
        );
        let server = Session::new(
            server_side,
            SessionConfig::server(Implementation::new("s", "0")),
        );
        server.register_request_handler(
            "echo",
            request_handler(|ctx: RequestContext| async move {
                Ok(ctx.params.unwrap_or(serde_json::Value::Null))
            }),
        );
        server.start();

        let result = client.initialize().await.unwrap();
        assert_eq!(result.server_info.name, "s");

        let value = client
            .send_request("echo", Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(value["ok"], true);

        client.dispose().await;
        server.dispose().await;
    }
}
