//! Session diagnostics: operation metrics and trace-context propagation.
//!
//! The engine takes an observer handle at construction instead of writing
//! to process-wide statics, so tests can substitute a recorder. The default
//! [`MetricsObserver`] emits through the `metrics` facade; whichever
//! exporter the application installs decides where the numbers go.

use std::fmt;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Histogram bucket boundaries, in seconds, for
/// `mcp_operation_duration_seconds`. Exporters that take explicit buckets
/// (e.g. the Prometheus exporter) should be configured with these values.
pub const DURATION_BUCKETS_SECONDS: &[f64] = &[
    0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// W3C trace-context pair carried through `params._meta`.
///
/// The engine treats both values as opaque strings; pairing with an actual
/// tracer is the observer's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// `traceparent` header value
    pub traceparent: String,
    /// `tracestate` header value
    pub tracestate: Option<String>,
}

/// Observer of session activity.
///
/// All hooks are synchronous and must be cheap; they run on the engine's
/// hot paths. The logging-message notification is never reported here.
pub trait SessionObserver: Send + Sync {
    /// One operation (outgoing request, incoming request, or notification
    /// send) completed with the given outcome label.
    fn operation_completed(&self, method: &str, outcome: &'static str, duration: Duration);

    /// Trace context to inject into outbound requests and notifications.
    fn current_trace_context(&self) -> Option<TraceContext> {
        None
    }

    /// Trace context extracted from an inbound request or notification.
    fn inbound_trace_context(&self, method: &str, context: &TraceContext) {
        let _ = (method, context);
    }

    /// A session became active or inactive.
    fn session_count_changed(&self, delta: i64) {
        let _ = delta;
    }
}

/// Observer that records through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

/// Register metric descriptions with the installed recorder.
///
/// Call once at startup, after installing an exporter.
pub fn describe_metrics() {
    describe_histogram!(
        "mcp_operation_duration_seconds",
        "Duration of MCP operations in seconds"
    );
    describe_counter!(
        "mcp_operations_total",
        "Total number of MCP operations, labelled by method and outcome"
    );
    describe_gauge!("mcp_active_sessions", "Number of live MCP sessions");
}

impl SessionObserver for MetricsObserver {
    fn operation_completed(&self, method: &str, outcome: &'static str, duration: Duration) {
        let method = method.to_string();
        histogram!(
            "mcp_operation_duration_seconds",
            "method" => method.clone(),
            "outcome" => outcome,
        )
        .record(duration.as_secs_f64());
        counter!(
            "mcp_operations_total",
            "method" => method,
            "outcome" => outcome,
        )
        .increment(1);
    }

    fn session_count_changed(&self, delta: i64) {
        gauge!("mcp_active_sessions").increment(delta as f64);
    }
}

/// Observer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn operation_completed(&self, _method: &str, _outcome: &'static str, _duration: Duration) {}
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.traceparent)
    }
}
