//! # fluxmcp-streamable
//!
//! The Streamable HTTP transport: one logical MCP session multiplexed
//! across short-lived POST exchanges plus an optional long-lived,
//! resumable SSE GET stream.
//!
//! Server side, [`StreamableHttpServer`] owns the session records and runs
//! one [`fluxmcp_session::Session`] engine per logical session; client
//! side, [`StreamableHttpClient`] is a regular
//! [`fluxmcp_transport::Transport`] the engine drives. The optional
//! [`distributed`] layer routes requests across nodes through a shared
//! session-owner cache.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

mod client;
mod config;
pub mod distributed;
mod server;
mod session;
pub mod sse;

pub use client::{StreamableHttpClient, StreamableHttpClientConfig};
pub use config::{ResponseMode, StreamableHttpConfig, StreamableHttpConfigBuilder};
pub use server::StreamableHttpServer;
pub use session::{
    HttpServerSession, LAST_EVENT_ID_HEADER, MAX_SESSION_ID_LEN, SESSION_ID_HEADER, SessionSetup,
    mint_session_id,
};
