//! Compact (de)serialization helpers shared by the transports.
//!
//! All transports exchange compact JSON. Stream transports additionally
//! frame messages with newlines, and SSE data lines must not contain raw
//! CR/LF; serde_json escapes control characters inside strings, so compact
//! encodings of well-formed messages satisfy both framings. [`encode`]
//! enforces the invariant anyway and fails rather than emit a broken frame.

use crate::jsonrpc::Message;

/// Encode a message as compact JSON suitable for newline and SSE framing.
pub fn encode(message: &Message) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(message)?;
    debug_assert!(
        !json.contains('\n') && !json.contains('\r'),
        "compact JSON must not contain raw CR/LF"
    );
    Ok(json)
}

/// Parse one wire payload: a single message or a batch.
pub fn decode(json: &str) -> Result<Message, serde_json::Error> {
    serde_json::from_str(json)
}

/// Parse one wire payload from raw bytes.
pub fn decode_bytes(bytes: &[u8]) -> Result<Message, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Whether a payload looks like a JSON-RPC batch.
pub fn is_batch(json: &str) -> bool {
    json.trim_start().starts_with('[')
}

/// Extract the method name without a full parse, for logging.
pub fn extract_method(json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    value.get("method")?.as_str().map(String::from)
}
