//! The MCP `params._meta` extension.
//!
//! Requests and notifications may carry a `_meta` object inside `params`.
//! Recognized keys are `progressToken` (progress correlation) and the W3C
//! trace-propagation pair `traceparent`/`tracestate`. Everything else is
//! preserved verbatim so `_meta` survives round-trips through handlers that
//! only declare a subset of the params fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Key of the metadata object inside `params`.
pub const META_KEY: &str = "_meta";

/// Key of the progress token inside `_meta`.
pub const PROGRESS_TOKEN_KEY: &str = "progressToken";

/// Key of the W3C trace parent inside `_meta`.
pub const TRACEPARENT_KEY: &str = "traceparent";

/// Key of the W3C trace state inside `_meta`.
pub const TRACESTATE_KEY: &str = "tracestate";

/// Progress token: a string or integer chosen by the requester.
///
/// Semantically distinct from a request id even when the values collide;
/// one token may receive many progress notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// String token
    String(String),
    /// Numeric token
    Number(i64),
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<String> for ProgressToken {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for ProgressToken {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for ProgressToken {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// Parsed view of `params._meta`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Progress correlation token
    #[serde(rename = "progressToken", skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
    /// W3C trace parent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
    /// W3C trace state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
    /// Unrecognized keys, preserved on round-trips
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestMeta {
    /// Parse the `_meta` object out of a params value, if present.
    pub fn from_params(params: Option<&Value>) -> Option<Self> {
        let meta = params?.get(META_KEY)?;
        serde_json::from_value(meta.clone()).ok()
    }

    /// True when no recognized or extra keys are set.
    pub fn is_empty(&self) -> bool {
        self.progress_token.is_none()
            && self.traceparent.is_none()
            && self.tracestate.is_none()
            && self.extra.is_empty()
    }
}

/// Read the progress token from a params value.
pub fn progress_token_of(params: Option<&Value>) -> Option<ProgressToken> {
    let token = params?.get(META_KEY)?.get(PROGRESS_TOKEN_KEY)?;
    serde_json::from_value(token.clone()).ok()
}

/// Insert or overwrite a single `_meta` field, creating the params object
/// and the `_meta` object as needed. Non-object params are left untouched.
pub fn set_meta_field(params: &mut Option<Value>, key: &str, value: Value) {
    let object = match params {
        Some(Value::Object(map)) => map,
        Some(_) => return,
        None => {
            *params = Some(Value::Object(Map::new()));
            match params {
                Some(Value::Object(map)) => map,
                _ => unreachable!(),
            }
        }
    };
    let meta = object
        .entry(META_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(meta) = meta {
        meta.insert(key.to_string(), value);
    }
}

/// Inject a progress token into `params._meta.progressToken`.
pub fn set_progress_token(params: &mut Option<Value>, token: &ProgressToken) {
    let value = serde_json::to_value(token).unwrap_or(Value::Null);
    set_meta_field(params, PROGRESS_TOKEN_KEY, value);
}

/// Inject W3C trace-context fields into `params._meta`.
pub fn set_trace_context(params: &mut Option<Value>, traceparent: &str, tracestate: Option<&str>) {
    set_meta_field(params, TRACEPARENT_KEY, Value::String(traceparent.to_string()));
    if let Some(state) = tracestate {
        set_meta_field(params, TRACESTATE_KEY, Value::String(state.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn token_kinds_are_distinct() {
        let s = ProgressToken::from("7");
        let n = ProgressToken::from(7i64);
        assert_ne!(s, n);
        assert_eq!(serde_json::to_string(&n).unwrap(), "7");
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"7\"");
    }

    #[test]
    fn meta_parses_known_and_extra_keys() {
        let params = json!({
            "_meta": {
                "progressToken": "tok-A",
                "traceparent": "00-abc-def-01",
                "vendorKey": {"nested": true}
            },
            "x": 1
        });
        let meta = RequestMeta::from_params(Some(&params)).unwrap();
        assert_eq!(meta.progress_token, Some(ProgressToken::from("tok-A")));
        assert_eq!(meta.traceparent.as_deref(), Some("00-abc-def-01"));
        assert_eq!(meta.extra["vendorKey"], json!({"nested": true}));
    }

    #[test]
    fn meta_round_trips_extra_keys() {
        let original = json!({"progressToken": 3, "custom": "kept"});
        let meta: RequestMeta = serde_json::from_value(original.clone()).unwrap();
        let reencoded = serde_json::to_value(&meta).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn set_progress_token_creates_params() {
        let mut params = None;
        set_progress_token(&mut params, &ProgressToken::from("t1"));
        assert_eq!(
            progress_token_of(params.as_ref()),
            Some(ProgressToken::from("t1"))
        );
    }

    #[test]
    fn set_meta_preserves_sibling_fields() {
        let mut params = Some(json!({"x": 1, "_meta": {"existing": true}}));
        set_trace_context(&mut params, "00-abc-def-01", Some("k=v"));
        let params = params.unwrap();
        assert_eq!(params["x"], 1);
        assert_eq!(params["_meta"]["existing"], true);
        assert_eq!(params["_meta"]["traceparent"], "00-abc-def-01");
        assert_eq!(params["_meta"]["tracestate"], "k=v");
    }

    #[test]
    fn non_object_params_are_untouched() {
        let mut params = Some(json!([1, 2, 3]));
        set_progress_token(&mut params, &ProgressToken::from(1i64));
        assert_eq!(params.unwrap(), json!([1, 2, 3]));
    }
}
