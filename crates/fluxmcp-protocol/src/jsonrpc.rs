//! # JSON-RPC 2.0 Message Algebra
//!
//! Canonical JSON-RPC 2.0 message types with the MCP `_meta` extension.
//! Every wire payload is one of [`Request`], [`Response`] (success or error),
//! [`Notification`], or a batch of those; [`Message`] is the untagged union
//! the codec produces and consumes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Marker type that serializes as the literal `"2.0"` and rejects anything else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "Invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// JSON-RPC request identifier: a string or a signed 64-bit integer.
///
/// Equality is exact per kind; the integer `7` and the string `"7"` are
/// distinct identifiers. Integers always serialize without a decimal point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String identifier
    String(String),
    /// Numeric identifier
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        Self::Number(i64::from(n))
    }
}

/// JSON-RPC request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Request method name
    pub method: String,
    /// Request identifier
    pub id: RequestId,
    /// Request parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Create a new request.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            id,
            params,
        }
    }

    /// Create a request with serializable parameters.
    pub fn with_params<P: Serialize>(
        method: impl Into<String>,
        params: P,
        id: RequestId,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(method, Some(serde_json::to_value(params)?), id))
    }
}

/// Response identifier: the originating request id, or `null` when the
/// request id was unparseable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(pub Option<RequestId>);

impl ResponseId {
    /// Response id for a correlated response.
    pub fn from_request(id: RequestId) -> Self {
        Self(Some(id))
    }

    /// Null id, permitted only on parse-error responses.
    pub fn null() -> Self {
        Self(None)
    }

    /// The request id, unless this is a parse-error response.
    pub fn as_request_id(&self) -> Option<&RequestId> {
        self.0.as_ref()
    }
}

/// Response payload: mutually exclusive `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Successful response
    Success {
        /// Response result
        result: Value,
    },
    /// Error response
    Error {
        /// Response error
        error: ErrorObject,
    },
}

/// JSON-RPC response message (success or error)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Request identifier (null only for parse errors)
    pub id: ResponseId,
    /// Result or error, never both
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl Response {
    /// Create a successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: ResponseId::from_request(id),
            payload: ResponsePayload::Success { result },
        }
    }

    /// Create an error response correlated to a request.
    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: ResponseId::from_request(id),
            payload: ResponsePayload::Error { error },
        }
    }

    /// Create a parse-error response with a null id.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: ResponseId::null(),
            payload: ResponsePayload::Error {
                error: ErrorObject::new(error_codes::PARSE_ERROR, message),
            },
        }
    }

    /// Whether this is a success response.
    pub fn is_success(&self) -> bool {
        matches!(self.payload, ResponsePayload::Success { .. })
    }

    /// The result, if this is a success response.
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Success { result } => Some(result),
            ResponsePayload::Error { .. } => None,
        }
    }

    /// The error, if this is an error response.
    pub fn error_object(&self) -> Option<&ErrorObject> {
        match &self.payload {
            ResponsePayload::Success { .. } => None,
            ResponsePayload::Error { error } => Some(error),
        }
    }
}

/// JSON-RPC notification message (no id, no reply)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Notification method name
    pub method: String,
    /// Notification parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Create a new notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }

    /// Create a notification with serializable parameters.
    pub fn with_params<P: Serialize>(
        method: impl Into<String>,
        params: P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(method, Some(serde_json::to_value(params)?)))
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,
    /// Short error description. This text crosses the wire and may be
    /// observed by the peer; never embed stack traces or internal paths.
    pub message: String,
    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create a new error object.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach additional data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Method-not-found error for the given method.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    /// Invalid-params error with detail text.
    pub fn invalid_params(details: &str) -> Self {
        Self::new(
            error_codes::INVALID_PARAMS,
            format!("Invalid params: {details}"),
        )
    }

    /// Internal error with detail text.
    pub fn internal(details: &str) -> Self {
        Self::new(
            error_codes::INTERNAL_ERROR,
            format!("Internal error: {details}"),
        )
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Standard JSON-RPC error codes
pub mod error_codes {
    /// Parse error - invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - the JSON is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// JSON-RPC message union.
///
/// A batch (JSON array) deserializes as [`Message::Batch`]; the session
/// engine dispatches its elements as if each had arrived individually,
/// in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Request message
    Request(Request),
    /// Response message (success or error)
    Response(Response),
    /// Notification message
    Notification(Notification),
    /// Batch of messages
    Batch(Vec<Message>),
}

impl Message {
    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) | Self::Batch(_) => None,
        }
    }

    /// Whether this message (or any batch element) is a request expecting
    /// a reply.
    pub fn contains_request(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Response(_) | Self::Notification(_) => false,
            Self::Batch(items) => items.iter().any(Message::contains_request),
        }
    }

    /// Request ids carried by this message, batch elements included.
    pub fn request_ids(&self) -> Vec<RequestId> {
        match self {
            Self::Request(r) => vec![r.id.clone()],
            Self::Response(_) | Self::Notification(_) => Vec::new(),
            Self::Batch(items) => items.iter().flat_map(Message::request_ids).collect(),
        }
    }

    /// Flatten into individual messages, preserving batch order.
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Batch(items) => items
                .into_iter()
                .flat_map(Message::into_messages)
                .collect(),
            other => vec![other],
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn version_round_trip() {
        let json = serde_json::to_string(&JsonRpcVersion).unwrap();
        assert_eq!(json, "\"2.0\"");
        let parsed: JsonRpcVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JsonRpcVersion);
        assert!(serde_json::from_str::<JsonRpcVersion>("\"1.0\"").is_err());
    }

    #[test]
    fn id_kinds_are_distinct() {
        let number: RequestId = serde_json::from_str("7").unwrap();
        let string: RequestId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(number, RequestId::Number(7));
        assert_eq!(string, RequestId::String("7".into()));
        assert_ne!(number, string);
    }

    #[test]
    fn numeric_id_serializes_without_decimal_point() {
        let id = RequestId::Number(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
    }

    #[test]
    fn request_round_trip_preserves_meta() {
        let raw = r#"{"jsonrpc":"2.0","id":10,"method":"doWork","params":{"_meta":{"progressToken":"tok-A"},"x":1}}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        let Message::Request(req) = msg else {
            panic!("expected request");
        };
        assert_eq!(req.method, "doWork");
        let reencoded = serde_json::to_value(&req).unwrap();
        assert_eq!(reencoded["params"]["_meta"]["progressToken"], "tok-A");
    }

    #[test]
    fn response_success_and_error_are_exclusive() {
        let ok = Response::success(RequestId::Number(1), json!({"v": true}));
        assert!(ok.is_success());
        assert!(ok.error_object().is_none());

        let err = Response::error(
            RequestId::Number(1),
            ErrorObject::method_not_found("nope"),
        );
        assert!(!err.is_success());
        assert_eq!(err.error_object().unwrap().code, -32601);
    }

    #[test]
    fn parse_error_has_null_id() {
        let resp = Response::parse_error("bad json");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], -32700);
    }

    #[test]
    fn notification_has_no_id() {
        let n = Notification::new("initialized", None);
        let value = serde_json::to_value(&n).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("params").is_none());
    }

    #[test]
    fn untagged_union_classifies_all_kinds() {
        let req: Message =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"m"}"#).unwrap();
        assert!(matches!(req, Message::Request(_)));

        let resp: Message =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(resp, Message::Response(_)));

        let err: Message = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"x"}}"#,
        )
        .unwrap();
        assert!(matches!(err, Message::Response(_)));

        let note: Message =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"m"}"#).unwrap();
        assert!(matches!(note, Message::Notification(_)));
    }

    #[test]
    fn batch_flattens_in_order() {
        let raw = r#"[
            {"jsonrpc":"2.0","id":1,"method":"a"},
            {"jsonrpc":"2.0","method":"b"},
            {"jsonrpc":"2.0","id":2,"method":"c"}
        ]"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert!(msg.contains_request());
        assert_eq!(
            msg.request_ids(),
            vec![RequestId::Number(1), RequestId::Number(2)]
        );
        let flat = msg.into_messages();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0].method(), Some("a"));
        assert_eq!(flat[1].method(), Some("b"));
        assert_eq!(flat[2].method(), Some("c"));
    }

    #[test]
    fn surrogate_pairs_unescape_correctly() {
        // U+1F600 GRINNING FACE as an escaped surrogate pair
        let raw = "{\"jsonrpc\":\"2.0\",\"method\":\"log\",\"params\":{\"text\":\"\\uD83D\\uDE00\"}}";
        let msg: Message = serde_json::from_str(raw).unwrap();
        let Message::Notification(n) = msg else {
            panic!("expected notification");
        };
        assert_eq!(n.params.unwrap()["text"], "\u{1F600}");
    }

    #[test]
    fn multibyte_utf8_round_trips() {
        for text in ["a", "\u{00e9}", "\u{4e16}\u{754c}", "\u{10348}"] {
            let n = Notification::with_params("log", json!({ "text": text })).unwrap();
            let encoded = serde_json::to_string(&n).unwrap();
            let decoded: Notification = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded.params.unwrap()["text"], text);
        }
    }
}
