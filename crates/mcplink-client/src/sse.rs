//! Server-Sent Events framing.
//!
//! Both transports read `text/event-stream` bodies through [`SseParser`], so
//! an inbound GET stream and an SSE-typed POST response are parsed the same way.

use futures::{Stream, StreamExt};

/// Event type used when a block carries no `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// Payload some streaming servers send as an end marker.
pub const DONE_MARKER: &str = "[DONE]";

/// A dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (`endpoint`, `message`, ...).
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Value of the `id:` field, if the block carried one.
    pub id: Option<String>,
}

impl SseEvent {
    /// Whether the payload is the `[DONE]` end marker.
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }
}

/// Incremental `text/event-stream` parser.
///
/// Feed raw body chunks in arrival order; complete events come out in the
/// same order. Chunk boundaries may fall anywhere, including inside a UTF-8
/// sequence or between `\r` and `\n`.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    last_event_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            self.process_line(&line);
        }
        self.dispatch()
    }

    /// Most recent `id:` seen on the stream, used to resume it.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => {
                self.id = Some(value.to_string());
                self.last_event_id = Some(value.to_string());
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id,
        })
    }
}

/// Adapt a byte-chunk stream into a stream of SSE events.
///
/// A chunk error is yielded once and ends the stream.
pub fn event_stream<S, B, E>(chunks: S) -> impl Stream<Item = Result<SseEvent, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    async_stream::stream! {
        let mut parser = SseParser::new();
        let chunks = chunks;
        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in parser.feed(bytes.as_ref()) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        if let Some(event) = parser.finish() {
            yield Ok(event);
        }
    }
}
