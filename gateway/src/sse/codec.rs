//! SSE frame parsing and serialization.
//!
//! The parser is an incremental byte -> event transform: feed it chunks as
//! they arrive and drain complete events. The serializer is the inverse.
//! Round-tripping a well-formed stream is the identity up to multi-line
//! `data` canonicalization and whitespace inside JSON.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::error::{RelayError, RelayResult};

/// Maximum parser buffer size (1 MiB) to bound memory when an upstream
/// sends data without frame delimiters.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Decoded `data` payload of an SSE event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseData {
    /// `data` parsed as JSON.
    Json(Value),
    /// `data` kept as the raw string (not valid JSON).
    Raw(String),
    /// The literal `[DONE]` marker some providers terminate with.
    Done,
}

impl SseData {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            SseData::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<SseData>,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// An event with a name and a JSON payload — the common case on the
    /// Messages API wire.
    pub fn named(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: Some(event.into()),
            data: Some(SseData::Json(data)),
            ..Self::default()
        }
    }

    /// Effective event type: the `event:` field, falling back to the
    /// payload's `"type"` when the field is absent.
    pub fn event_type(&self) -> Option<&str> {
        if let Some(event) = self.event.as_deref() {
            return Some(event);
        }
        self.data
            .as_ref()
            .and_then(SseData::as_json)
            .and_then(|v| v.get("type"))
            .and_then(Value::as_str)
    }

    pub fn data_json(&self) -> Option<&Value> {
        self.data.as_ref().and_then(SseData::as_json)
    }

    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_none() && self.id.is_none() && self.retry.is_none()
    }
}

/// Incremental SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    event: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> RelayResult<Vec<SseEvent>> {
        if self.buffer.len() + chunk.len() > MAX_BUFFER_SIZE {
            return Err(RelayError::Codec(format!(
                "SSE buffer exceeded {MAX_BUFFER_SIZE} bytes without a frame delimiter"
            )));
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(line) = self.take_line() {
            if let Some(event) = self.consume_line(&line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Flush a trailing frame that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&self.buffer.split()).into_owned();
            self.consume_line(line.trim_end_matches('\r'));
        }
        let event = self.take_frame();
        (!event.is_empty()).then_some(event)
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Apply one line to the frame in progress; a blank line completes it.
    fn consume_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let event = self.take_frame();
            return (!event.is_empty()).then_some(event);
        }

        // Comment lines keep the connection warm; they carry nothing.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => self.retry = value.trim().parse().ok(),
            _ => {}
        }
        None
    }

    fn take_frame(&mut self) -> SseEvent {
        let data = if self.data_lines.is_empty() {
            None
        } else {
            Some(decode_data(&self.data_lines.join("\n")))
        };
        self.data_lines.clear();

        SseEvent {
            event: self.event.take(),
            data,
            id: self.id.take(),
            retry: self.retry.take(),
        }
    }
}

fn decode_data(raw: &str) -> SseData {
    if raw == "[DONE]" {
        return SseData::Done;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => SseData::Json(value),
        Err(_) => SseData::Raw(raw.to_string()),
    }
}

/// Serialize one event to wire bytes.
pub fn encode_event(event: &SseEvent) -> Bytes {
    let mut out = String::new();
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    match &event.data {
        Some(SseData::Json(value)) => {
            out.push_str("data: ");
            out.push_str(&value.to_string());
            out.push('\n');
        }
        Some(SseData::Raw(raw)) => {
            for line in raw.split('\n') {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        Some(SseData::Done) => out.push_str("data: [DONE]\n"),
        None => {}
    }
    if let Some(id) = &event.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(retry) = event.retry {
        out.push_str(&format!("retry: {retry}\n"));
    }
    out.push('\n');
    Bytes::from(out)
}
