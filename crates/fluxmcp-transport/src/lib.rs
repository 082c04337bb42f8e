//! # fluxmcp-transport
//!
//! The transport abstraction the session engine drives, plus the thin
//! transports: an in-memory channel pair, stdio (current process or child
//! process pipes), and TCP. Stream transports frame messages as
//! newline-delimited compact JSON.
//!
//! The Streamable HTTP transport lives in its own crate
//! (`fluxmcp-streamable`); its semantics are a superset of the
//! [`Transport`] contract here.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

mod child;
mod error;
mod framing;
pub mod memory;
mod stdio;
mod tcp;
mod traits;

pub use child::ChildProcessTransport;
pub use error::{TransportError, TransportResult, validate_message_size};
pub use memory::MemoryTransport;
pub use stdio::StdioTransport;
pub use tcp::TcpTransport;
pub use traits::{Transport, TransportState};
