//! Protocol types for the session handshake and the out-of-band
//! progress/cancellation/logging notifications.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::meta::ProgressToken;
use crate::jsonrpc::RequestId;

/// Protocol version date string (e.g. `"2025-03-26"`).
pub type ProtocolVersion = String;

/// Latest protocol version this implementation speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// All protocol versions this implementation accepts, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Method names for the handshake and the out-of-band notifications.
pub mod methods {
    /// Handshake request
    pub const INITIALIZE: &str = "initialize";
    /// Handshake-complete notification from the initiator
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness request, answered with an empty object
    pub const PING: &str = "ping";
    /// Cancellation notification (emitted form)
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Cancellation notification (accepted ingress alias)
    pub const CANCELLED_ALIAS: &str = "$/cancelled";
    /// Progress notification (emitted form)
    pub const PROGRESS: &str = "notifications/progress";
    /// Progress notification (accepted ingress alias)
    pub const PROGRESS_ALIAS: &str = "$/progress";
    /// Log-level selection request
    pub const SET_LEVEL: &str = "logging/setLevel";
    /// Log message notification
    pub const LOG_MESSAGE: &str = "notifications/message";

    /// Whether `method` names a cancellation notification.
    pub fn is_cancelled(method: &str) -> bool {
        method == CANCELLED || method == CANCELLED_ALIAS
    }

    /// Whether `method` names a progress notification.
    pub fn is_progress(method: &str) -> bool {
        method == PROGRESS || method == PROGRESS_ALIAS
    }
}

/// Name and version of one endpoint implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name (programmatic identifier)
    pub name: String,
    /// Display title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Implementation version
    pub version: String,
}

impl Implementation {
    /// Create implementation info.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            version: version.into(),
        }
    }
}

impl Default for Implementation {
    fn default() -> Self {
        Self::new("unknown", "0.0.0")
    }
}

/// Opaque capability descriptor exchanged during the handshake.
///
/// The engine records the peer's descriptor verbatim and only presence-tests
/// the well-known top-level keys; the values are never interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub Map<String, Value>);

/// Well-known capability keys the engine presence-tests.
pub mod capability_keys {
    /// Tool invocation
    pub const TOOLS: &str = "tools";
    /// Prompt templates
    pub const PROMPTS: &str = "prompts";
    /// Resource reads
    pub const RESOURCES: &str = "resources";
    /// Log forwarding
    pub const LOGGING: &str = "logging";
    /// LLM sampling
    pub const SAMPLING: &str = "sampling";
    /// Filesystem roots
    pub const ROOTS: &str = "roots";
    /// Argument completion
    pub const COMPLETIONS: &str = "completions";
}

impl Capabilities {
    /// Empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a capability group, with an empty descriptor body.
    pub fn with(mut self, key: &str) -> Self {
        self.0.insert(key.to_string(), Value::Object(Map::new()));
        self
    }

    /// Declare a capability group with an explicit descriptor body.
    pub fn with_descriptor(mut self, key: &str, descriptor: Value) -> Self {
        self.0.insert(key.to_string(), descriptor);
        self
    }

    /// Whether the peer declared the given capability group.
    pub fn supports(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Presence test for `logging`.
    pub fn supports_logging(&self) -> bool {
        self.supports(capability_keys::LOGGING)
    }
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParams {
    /// Proposed protocol version
    pub protocol_version: ProtocolVersion,
    /// Initiator capability descriptor
    pub capabilities: Capabilities,
    /// Initiator implementation info
    pub client_info: Implementation,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Negotiated protocol version
    pub protocol_version: ProtocolVersion,
    /// Responder capability descriptor
    pub capabilities: Capabilities,
    /// Responder implementation info
    pub server_info: Implementation,
    /// Optional usage instructions for the initiator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Parameters of a cancellation notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    /// Id of the request being cancelled
    pub request_id: RequestId,
    /// Optional human-readable reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Parameters of a progress notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    /// Token correlating this update to an in-flight request
    pub progress_token: ProgressToken,
    /// Progress so far; monotonically increasing
    pub progress: f64,
    /// Total units of work, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Optional status text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Severity levels for log-message notifications (RFC 5424 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    /// Detailed debugging information
    Debug,
    /// Normal operational messages
    Info,
    /// Notable but normal events
    Notice,
    /// Warning conditions
    Warning,
    /// Error conditions
    Error,
    /// Critical conditions
    Critical,
    /// Action must be taken immediately
    Alert,
    /// System is unusable
    Emergency,
}

/// Parameters of `logging/setLevel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLevelParams {
    /// New minimum level the peer wants forwarded
    pub level: LoggingLevel,
}

/// Parameters of `notifications/message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingMessageParams {
    /// Message severity
    pub level: LoggingLevel,
    /// Originating logger name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    /// Arbitrary structured payload
    pub data: Value,
}

/// Empty result object, used by `ping` and other fire-and-acknowledge
/// requests.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EmptyResult {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn initialize_params_use_wire_field_names() {
        let params = InitializeRequestParams {
            protocol_version: "2024-11-05".into(),
            capabilities: Capabilities::new(),
            client_info: Implementation::new("t", "0"),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(
            value,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "t", "version": "0"}
            })
        );
    }

    #[test]
    fn capabilities_presence_tests_are_key_based() {
        let caps: Capabilities = serde_json::from_value(json!({
            "tools": {"listChanged": true},
            "logging": {},
            "experimental": {"x": 1}
        }))
        .unwrap();
        assert!(caps.supports(capability_keys::TOOLS));
        assert!(caps.supports_logging());
        assert!(!caps.supports(capability_keys::SAMPLING));
        // Unknown keys are retained opaquely.
        assert_eq!(caps.0["experimental"], json!({"x": 1}));
    }

    #[test]
    fn cancelled_params_match_wire_shape() {
        let raw = json!({"requestId": 5, "reason": "user"});
        let params: CancelledParams = serde_json::from_value(raw).unwrap();
        assert_eq!(params.request_id, RequestId::Number(5));
        assert_eq!(params.reason.as_deref(), Some("user"));
    }

    #[test]
    fn progress_params_round_trip() {
        let params = ProgressParams {
            progress_token: ProgressToken::from("tok-A"),
            progress: 0.5,
            total: Some(1.0),
            message: None,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["progressToken"], "tok-A");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn logging_levels_order_by_severity() {
        assert!(LoggingLevel::Debug < LoggingLevel::Warning);
        assert!(LoggingLevel::Error < LoggingLevel::Emergency);
        let level: LoggingLevel = serde_json::from_value(json!("warning")).unwrap();
        assert_eq!(level, LoggingLevel::Warning);
    }

    #[test]
    fn cancellation_method_aliases_are_accepted() {
        assert!(methods::is_cancelled("notifications/cancelled"));
        assert!(methods::is_cancelled("$/cancelled"));
        assert!(!methods::is_cancelled("notifications/progress"));
        assert!(methods::is_progress("$/progress"));
        assert!(methods::is_progress("notifications/progress"));
    }
}
