//! Protocol-level error values.
//!
//! A peer that answers a request with a JSON-RPC error produces a
//! [`ProtocolError`] on the caller's side. It is a plain value, not a
//! panic path: business outcomes travel as `Result<T, ProtocolError>`.

use serde_json::Value;
use thiserror::Error;

use crate::jsonrpc::{ErrorObject, error_codes};

/// Error returned by the remote peer for a request.
///
/// Carries the JSON-RPC error triple verbatim. Retrying is at the caller's
/// discretion; the engine never retries automatically.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} (code {code})")]
pub struct ProtocolError {
    /// JSON-RPC error code
    pub code: i32,
    /// Error message. This text crosses the wire in both directions and may
    /// be observed by the peer; construct it without stack traces or
    /// internal details.
    pub message: String,
    /// Additional error data
    pub data: Option<Value>,
}

impl ProtocolError {
    /// Create a protocol error with an application-chosen code.
    ///
    /// `message` is peer-visible; see the field documentation.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach additional error data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Internal-error value (`-32603`).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    /// Invalid-params value (`-32602`).
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    /// Method-not-found value (`-32601`).
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }
}

impl From<ErrorObject> for ProtocolError {
    fn from(e: ErrorObject) -> Self {
        Self {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

impl From<ProtocolError> for ErrorObject {
    fn from(e: ProtocolError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}
