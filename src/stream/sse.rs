//! Incremental SSE (Server-Sent Events) frame parser.
//!
//! Handles buffering of partial lines and partial blocks across chunk
//! boundaries, and field semantics per the
//! [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html).
use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use memchr::memchr_iter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Frame;
use crate::error::ChatError;

// ---------------------------------------------------------------------------
// SseParser: incremental SSE line parser
// ---------------------------------------------------------------------------

/// Incremental SSE line parser.
///
/// Feed it text chunks (arriving at arbitrary boundaries) and it yields
/// fully-assembled [`Frame`]s. A frame is only produced once its terminating
/// blank line has been seen.
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
    at_stream_start: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            event_type: None,
            data_buffer: String::new(),
            has_data: false,
            last_event_id: None,
            at_stream_start: true,
        }
    }

    /// Feed raw text and return any complete frames parsed.
    ///
    /// - `event:` sets the event name of the pending block
    /// - `data:` appends to the data buffer (one leading space stripped);
    ///   multiple `data:` lines are joined with `\n`
    /// - an empty line dispatches the pending block if it had a `data:` line
    /// - `:` lines are comments
    /// - a line without a colon is a field name with an empty value
    /// - a byte order mark at the very start of the stream is skipped
    /// - `id:` sets the last event id, carried onto later frames
    /// - `retry:` with an integer value emits [`Frame::RetryInterval`] at once
    pub fn feed(&mut self, chunk: &str) -> Vec<Frame> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete frames into a caller-provided buffer.
    pub fn feed_into(&mut self, mut chunk: &str, out: &mut Vec<Frame>) {
        if self.at_stream_start && !chunk.is_empty() {
            chunk = chunk.strip_prefix('\u{feff}').unwrap_or(chunk);
            self.at_stream_start = false;
        }
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.last_event_id,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Whether an unterminated line or block is still buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.read_offset < self.buffer.len() || self.has_data || self.event_type.is_some()
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        last_event_id: &mut Option<String>,
        frames: &mut Vec<Frame>,
    ) {
        if line.is_empty() {
            if *has_data {
                frames.push(Frame::Event {
                    event: event_type.take(),
                    data: std::mem::take(data_buffer),
                    id: last_event_id.clone(),
                });
                *has_data = false;
            } else {
                // a block without data dispatches nothing but still resets the name
                *event_type = None;
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if *has_data {
                    data_buffer.push('\n');
                } else {
                    *has_data = true;
                }
                data_buffer.push_str(value);
            }
            "event" => *event_type = Some(value.to_string()),
            "id" => *last_event_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    frames.push(Frame::RetryInterval(ms));
                }
            }
            _ => {}
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Utf8ChunkDecoder: incremental byte -> text decoding
// ---------------------------------------------------------------------------

/// Decodes UTF-8 across chunk boundaries.
///
/// A multi-byte character split between two chunks is held back until the
/// rest of it arrives, so chunking never changes the decoded text.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, returning every complete character available.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Protocol`] when the bytes are not valid UTF-8
    /// (as opposed to merely incomplete).
    pub fn decode(&mut self, bytes: &[u8]) -> Result<String, ChatError> {
        if self.pending.is_empty() {
            if let Ok(text) = std::str::from_utf8(bytes) {
                return Ok(text.to_owned());
            }
        }
        self.pending.extend_from_slice(bytes);

        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(err) => {
                return Err(ChatError::Protocol(format!(
                    "invalid UTF-8 in event stream after {} bytes",
                    err.valid_up_to()
                )));
            }
        };

        let text = String::from_utf8(self.pending.drain(..valid_up_to).collect())
            .map_err(|err| ChatError::Protocol(format!("invalid UTF-8 in event stream: {err}")))?;
        Ok(text)
    }

    /// Number of bytes still waiting for the rest of their character.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

struct FrameStreamState<S> {
    bytes: std::pin::Pin<Box<S>>,
    decoder: Utf8ChunkDecoder,
    parser: SseParser,
    parsed: Vec<Frame>,
    pending: VecDeque<Frame>,
    cancel: CancellationToken,
    finished: bool,
}

impl<S> FrameStreamState<S> {
    fn fail(mut self, err: ChatError) -> Option<(Result<Frame, ChatError>, Self)> {
        self.finished = true;
        self.pending.clear();
        Some((Err(err), self))
    }
}

/// Split a byte stream into SSE frames.
///
/// Bytes are decoded incrementally as UTF-8, fed into an [`SseParser`] and
/// complete frames are yielded in arrival order. The cancellation token is
/// checked before every chunk read and every frame emission; once it fires
/// the stream yields [`ChatError::Cancelled`] and drops the byte source.
/// The first error ends the stream. An unterminated block left when the
/// source closes is discarded.
pub fn frame_stream<S>(
    byte_stream: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Frame, ChatError>> + Send
where
    S: Stream<Item = Result<Bytes, ChatError>> + Send + 'static,
{
    let state = FrameStreamState {
        bytes: Box::pin(byte_stream),
        decoder: Utf8ChunkDecoder::new(),
        parser: SseParser::new(),
        parsed: Vec::with_capacity(8),
        pending: VecDeque::with_capacity(8),
        cancel,
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            if state.cancel.is_cancelled() {
                return state.fail(ChatError::Cancelled);
            }
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }

            match state.bytes.as_mut().next().await {
                Some(Ok(chunk)) => {
                    let text = match state.decoder.decode(&chunk) {
                        Ok(text) => text,
                        Err(err) => return state.fail(err),
                    };
                    state.parser.feed_into(&text, &mut state.parsed);
                    state.pending.extend(state.parsed.drain(..));
                }
                Some(Err(err)) => return state.fail(err),
                None => {
                    if state.parser.has_partial() || state.decoder.pending_len() > 0 {
                        debug!(
                            pending_utf8_bytes = state.decoder.pending_len(),
                            "event stream closed with an unterminated block; discarding it"
                        );
                    }
                    return None;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
