//! Wire protocol: server-sent-event frames for run events, JSON for
//! requests.
//!
//! A frame is `event: <kind>\ndata: <payload>\n\n`. Payloads are escaped so
//! a frame always carries exactly one `data:` line: `\` becomes `\\`, LF
//! becomes `\n` and CR becomes `\r`.

use scriptdeck_core::{EventKind, RunEvent, SessionId};
use serde::{Deserialize, Serialize};

/// One encoded run event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: EventKind,
    /// Unescaped payload.
    pub data: String,
}

impl Frame {
    #[must_use]
    pub fn new(kind: EventKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Frame carrying `event`'s wire payload.
    #[must_use]
    pub fn from_event(event: &RunEvent) -> Self {
        Self::new(event.kind(), event.payload())
    }

    #[must_use]
    pub fn into_event(self) -> RunEvent {
        RunEvent::from_parts(self.kind, self.data)
    }

    /// Text form of the frame, terminated by a blank line.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind, escape(&self.data))
    }

    /// The frame as an axum SSE event.
    #[cfg(feature = "http")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        axum::response::sse::Event::default()
            .event(self.kind.as_str())
            .data(escape(&self.data))
    }
}

impl From<&RunEvent> for Frame {
    fn from(event: &RunEvent) -> Self {
        Self::from_event(event)
    }
}

/// Escape a payload for a single `data:` line.
#[must_use]
pub fn escape(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    for c in payload.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`]. Unknown escapes are kept as written.
#[must_use]
pub fn unescape(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    let mut chars = data.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Incremental frame parser for a client reading the event stream.
///
/// Accepts arbitrary chunk boundaries. Comment lines (`:`), unknown fields
/// and frames of unknown kind are skipped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    kind: Option<String>,
    data: Vec<String>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the frames it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<Frame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that wasn't followed by a blank line.
    pub fn finish(mut self) -> Option<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            if let Some(frame) = self.line(rest.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.kind = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let kind = self.kind.take();
        let data = std::mem::take(&mut self.data);
        if kind.is_none() && data.is_empty() {
            return None;
        }
        let kind = kind?;
        match kind.parse::<EventKind>() {
            Ok(kind) => Some(Frame::new(kind, unescape(&data.join("\n")))),
            Err(err) => {
                tracing::debug!(%err, "Skipping frame");
                None
            }
        }
    }
}

/// Body of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelMessage {
    pub session_id: SessionId,
}

/// Body of a rename request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameMessage {
    pub old_name: String,
    pub new_name: String,
    #[serde(default)]
    pub description: String,
    pub body: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub working_directory: Option<std::path::PathBuf>,
}
