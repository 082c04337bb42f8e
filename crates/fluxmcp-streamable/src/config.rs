//! Streamable HTTP transport configuration.

use std::time::Duration;

/// How the server answers a POST that carries requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// `text/event-stream` sub-stream carrying notifications and replies
    #[default]
    Sse,
    /// Buffer the replies and answer with one `application/json` body
    Json,
}

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct StreamableHttpConfig {
    /// MCP endpoint path (default `/mcp`)
    pub endpoint_path: String,
    /// How POSTs carrying requests are answered
    pub response_mode: ResponseMode,
    /// Keep-alive comment interval on the GET stream
    pub keep_alive: Duration,
    /// Replay buffer bound: events retained per session
    pub replay_buffer_events: usize,
    /// Replay buffer bound: bytes retained per session
    pub replay_buffer_bytes: usize,
    /// Maximum accepted POST body, in bytes
    pub max_body_bytes: usize,
    /// Stateless operation: no per-session state between POSTs, no GET
    /// stream, no server-initiated requests
    pub stateless: bool,
    /// Sessions idle longer than this are expired lazily
    pub session_idle_timeout: Duration,
}

impl Default for StreamableHttpConfig {
    fn default() -> Self {
        Self {
            endpoint_path: "/mcp".to_string(),
            response_mode: ResponseMode::Sse,
            keep_alive: Duration::from_secs(30),
            replay_buffer_events: 1024,
            replay_buffer_bytes: 8 * 1024 * 1024,
            max_body_bytes: 4 * 1024 * 1024,
            stateless: false,
            session_idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Builder for [`StreamableHttpConfig`].
#[derive(Debug, Clone, Default)]
pub struct StreamableHttpConfigBuilder {
    config: StreamableHttpConfig,
}

impl StreamableHttpConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the MCP endpoint path.
    pub fn with_endpoint_path(mut self, path: impl Into<String>) -> Self {
        self.config.endpoint_path = path.into();
        self
    }

    /// Answer request-bearing POSTs with buffered JSON instead of SSE.
    pub fn with_json_responses(mut self) -> Self {
        self.config.response_mode = ResponseMode::Json;
        self
    }

    /// Set the GET-stream keep-alive interval.
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.config.keep_alive = interval;
        self
    }

    /// Bound the per-session replay buffer.
    pub fn with_replay_buffer(mut self, events: usize, bytes: usize) -> Self {
        self.config.replay_buffer_events = events;
        self.config.replay_buffer_bytes = bytes;
        self
    }

    /// Bound accepted POST bodies.
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.config.max_body_bytes = bytes;
        self
    }

    /// Run without per-session state.
    pub fn stateless(mut self) -> Self {
        self.config.stateless = true;
        self
    }

    /// Set the idle expiry for session records.
    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout = timeout;
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> StreamableHttpConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bounds() {
        let config = StreamableHttpConfig::default();
        assert_eq!(config.endpoint_path, "/mcp");
        assert_eq!(config.replay_buffer_events, 1024);
        assert_eq!(config.replay_buffer_bytes, 8 * 1024 * 1024);
        assert_eq!(config.response_mode, ResponseMode::Sse);
        assert!(!config.stateless);
    }

    #[test]
    fn builder_applies_overrides() {
        let config = StreamableHttpConfigBuilder::new()
            .with_endpoint_path("/api/mcp")
            .with_json_responses()
            .with_replay_buffer(64, 1024)
            .stateless()
            .build();
        assert_eq!(config.endpoint_path, "/api/mcp");
        assert_eq!(config.response_mode, ResponseMode::Json);
        assert_eq!(config.replay_buffer_events, 64);
        assert!(config.stateless);
    }
}
