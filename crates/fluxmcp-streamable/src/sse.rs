//! Server-Sent Events framing.
//!
//! Wire format per event:
//!
//! ```text
//! event: message\n
//! data: <compact JSON>\n
//! [id: <n>\n]
//! \n
//! ```
//!
//! The JSON payload must not contain raw CR/LF; the compact codec
//! guarantees that. Event ids are monotonically increasing within a
//! session and carry the resumption cursor for `Last-Event-ID`.

use std::fmt::Write as _;

/// One SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; the transport only emits `message`
    pub event: String,
    /// Payload, one compact JSON message
    pub data: String,
    /// Monotonic resumption id, when the event is replayable
    pub id: Option<u64>,
}

impl SseEvent {
    /// A `message` event carrying one encoded JSON-RPC message.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: "message".to_string(),
            data: data.into(),
            id: None,
        }
    }

    /// Attach a resumption id.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Frame the event for the wire.
    pub fn to_frame(&self) -> String {
        let mut frame = String::with_capacity(self.data.len() + 32);
        let _ = writeln!(frame, "event: {}", self.event);
        let _ = writeln!(frame, "data: {}", self.data);
        if let Some(id) = self.id {
            let _ = writeln!(frame, "id: {id}");
        }
        frame.push('\n');
        frame
    }

    /// Approximate retained size, for replay-buffer accounting.
    pub fn frame_bytes(&self) -> usize {
        self.event.len() + self.data.len() + 32
    }
}

/// A keep-alive comment frame.
pub fn keep_alive_frame() -> &'static str {
    ": keep-alive\n\n"
}

/// Incremental SSE parser for the client side.
///
/// Feed raw chunks as they arrive; completed events come back in order.
/// Comment lines and unknown fields are ignored, as the SSE standard
/// requires.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
    id: Option<u64>,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.flush() {
                    events.push(event);
                }
                continue;
            }
            if let Some(comment) = line.strip_prefix(':') {
                let _ = comment;
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = value.parse().ok(),
                _ => {}
            }
        }
        events
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.event.is_none() && self.data.is_empty() && self.id.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: self.data.drain(..).collect::<Vec<_>>().join("\n"),
            id: self.id.take(),
        };
        Some(event)
    }
}
