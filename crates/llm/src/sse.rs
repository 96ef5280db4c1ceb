//! Incremental Server-Sent-Events framing.
//!
//! All four providers stream over SSE, but not all of them speak it
//! cleanly: the Gemini Code Assist endpoint occasionally emits bare JSON
//! lines without a `data:` prefix, and chunk boundaries from the HTTP
//! layer land anywhere, including mid-escape inside a `data:` payload.
//! The framer here is therefore deliberately lenient and restartable:
//! feed it byte chunks in any split, get the same events out.
//!
//! Two surfaces: a push-style [`Framer`] for callers that own their read
//! loop, and [`SseStreamExt::sse_events`] adapting a byte stream the way
//! the provider modules consume it.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use pin_project::pin_project;

/// One framed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, `"message"` when absent.
    pub event_type: String,
    /// Joined `data:` payload (multiple lines joined with `\n`).
    pub data: String,
}

/// Push-style SSE framer with a carry-over tail buffer.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: String,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of bytes. Invalid UTF-8 is replaced, not dropped.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Pop the next complete event, if a full block is buffered.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            let (block_end, sep_len) = find_blank_line(&self.buffer)?;

            let block: String = self.buffer.drain(..block_end + sep_len).collect();
            let block = &block[..block_end];

            if let Some(event) = parse_block(block) {
                return Some(event);
            }
            // Comment-only or empty block; keep scanning.
        }
    }

    /// Consume the unterminated tail at end of stream.
    ///
    /// Providers usually terminate the last event properly, but a
    /// connection dropped mid-block still carries a parseable payload.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let tail = std::mem::take(&mut self.buffer);
        parse_block(&tail)
    }
}

/// Locate the first blank line: `\n\n` or `\n\r\n`. Returns the offset of
/// the terminating `\n` of the last content line and the separator width.
fn find_blank_line(buffer: &str) -> Option<(usize, usize)> {
    let bytes = buffer.as_bytes();
    let mut i = 0;

    while let Some(pos) = buffer[i..].find('\n').map(|p| p + i) {
        let rest = &bytes[pos + 1..];
        if rest.first() == Some(&b'\n') {
            return Some((pos, 2));
        }
        if rest.first() == Some(&b'\r') && rest.get(1) == Some(&b'\n') {
            return Some((pos, 3));
        }
        i = pos + 1;
    }

    None
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event_type: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim_start_matches(' ').to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if line.starts_with('{') || line.starts_with('[') {
            // Lenient fallback: some internal endpoints stream raw JSON
            // lines without the field prefix.
            data_lines.push(line);
        }
        // Comments (`:`), `id:`, `retry:` and anything else are ignored.
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event_type: event_type.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}

/// Stream adapter over a byte stream, yielding framed events.
#[pin_project]
pub struct SseEventStream<S> {
    #[pin]
    inner: S,
    framer: Framer,
    done: bool,
}

impl<S, E> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    type Item = crate::Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.framer.next_event() {
                return Poll::Ready(Some(Ok(event)));
            }

            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.framer.push(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(crate::LlmError::ConnectionError(e.to_string()))));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    if let Some(event) = this.framer.finish() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Extension adapting byte streams into SSE event streams.
pub trait SseStreamExt: Sized {
    fn sse_events(self) -> SseEventStream<Self>;
}

impl<S, E> SseStreamExt for S
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    fn sse_events(self) -> SseEventStream<Self> {
        SseEventStream {
            inner: self,
            framer: Framer::new(),
            done: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(framer: &mut Framer) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(event) = framer.next_event() {
            events.push(event);
        }
        events
    }

    fn frame_all(input: &[u8]) -> Vec<SseEvent> {
        let mut framer = Framer::new();
        framer.push(input);
        let mut events = drain(&mut framer);
        events.extend(framer.finish());
        events
    }

    #[test]
    fn basic_event_with_type() {
        let events = frame_all(b"event: message_start\ndata: {\"a\":1}\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "message_start");
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn default_event_type_is_message() {
        let events = frame_all(b"data: hello\n\n");

        assert_eq!(events[0].event_type, "message");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let events = frame_all(b"data: one\ndata: two\n\n");

        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn crlf_separators_are_tolerated() {
        let events = frame_all(b"event: ping\r\ndata: {}\r\n\r\ndata: x\r\n\r\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "ping");
        assert_eq!(events[0].data, "{}");
        assert_eq!(events[1].data, "x");
    }

    #[test]
    fn bare_json_lines_are_accepted_as_data() {
        let events = frame_all(b"{\"candidates\":[]}\n\n[1,2]\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"candidates\":[]}");
        assert_eq!(events[1].data, "[1,2]");
    }

    #[test]
    fn comment_only_blocks_are_skipped() {
        let events = frame_all(b": keep-alive\n\ndata: real\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn unterminated_tail_is_flushed_at_finish() {
        let mut framer = Framer::new();
        framer.push(b"data: partial");

        assert!(framer.next_event().is_none());
        let tail = framer.finish().unwrap();
        assert_eq!(tail.data, "partial");
    }

    #[test]
    fn framing_is_invariant_under_chunk_splits() {
        let input: &[u8] =
            b"event: content_block_delta\ndata: {\"delta\":{\"text\":\"hi\"}}\n\nevent: done\ndata: [DONE]\r\n\r\n";
        let expected = frame_all(input);

        for split in 0..=input.len() {
            let mut framer = Framer::new();
            framer.push(&input[..split]);
            let mut events = drain(&mut framer);
            framer.push(&input[split..]);
            events.extend(drain(&mut framer));
            events.extend(framer.finish());

            assert_eq!(events, expected, "mismatch at split {split}");
        }
    }
}
