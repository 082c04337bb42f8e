//! # fluxmcp-protocol
//!
//! JSON-RPC 2.0 wire algebra for the fluxmcp Model Context Protocol stack.
//!
//! This crate owns everything that crosses a transport: the message union
//! ([`jsonrpc`]), the `params._meta` extension ([`meta`]), the handshake and
//! notification payload types ([`types`]), protocol error values
//! ([`error`]), and the compact codec helpers ([`codec`]). It has no I/O
//! and no async dependency; the session engine and the transports build on
//! top of it.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

/// Default upper bound on a single framed message, in bytes.
///
/// Transports reject frames above this size rather than buffer them;
/// individual transports may configure a lower limit.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub mod codec;
pub mod error;
pub mod jsonrpc;
pub mod meta;
pub mod types;

pub use error::ProtocolError;
pub use jsonrpc::{
    ErrorObject, JsonRpcVersion, Message, Notification, Request, RequestId, Response, ResponseId,
    ResponsePayload, error_codes,
};
pub use meta::{ProgressToken, RequestMeta};
pub use types::{
    Capabilities, CancelledParams, EmptyResult, Implementation, InitializeRequestParams,
    InitializeResult, LoggingLevel, LoggingMessageParams, ProgressParams, ProtocolVersion,
    SetLevelParams, methods, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
