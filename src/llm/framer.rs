//! Incremental server-sent-event framing.
//!
//! [`SseFramer`] accepts upstream bytes in whatever pieces the network hands
//! over and yields complete events. A multi-byte UTF-8 character split across
//! two reads is held back until its remaining bytes arrive, and an event is
//! never interpreted before its terminating blank line has been seen.
//!
//! ```text
//!   push(bytes)            next_segment() drains
//!  ┌─────────────┐ ──────► ┌──────────┐ ───────────► Accumulating
//!  │Accumulating │         │ Emitting │
//!  └─────────────┘ ◄────── └──────────┘
//!         │    \                │  [DONE]
//!   fail()│     \ finish()      ▼
//!         ▼      └────────►  ┌──────┐
//!     ┌────────┐             │ Done │
//!     │Errored │             └──────┘
//!     └────────┘
//! ```

use std::collections::VecDeque;

/// Payload that ends a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const EVENT_DELIMITER: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    /// Waiting for the rest of an event.
    Accumulating,
    /// At least one complete event is queued.
    Emitting,
    /// The sentinel was seen or the upstream ended. Terminal.
    Done,
    /// The upstream failed. Terminal.
    Errored,
}

/// One complete event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// The `data:` payload. Multi-line payloads are joined with `\n`.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
    /// An event without `data:` lines, such as a comment or keep-alive.
    Ignored,
}

/// Stateful UTF-8 decoder that carries incomplete trailing sequences over to
/// the next call.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `pending + bytes` as forms complete characters.
    /// Invalid sequences become U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest: &[u8] = &input;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes a dangling partial sequence as U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[derive(Debug)]
pub struct SseFramer {
    decoder: Utf8Decoder,
    buffer: String,
    ready: VecDeque<String>,
    state: FramerState,
}

impl Default for SseFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl SseFramer {
    pub fn new() -> Self {
        Self {
            decoder: Utf8Decoder::new(),
            buffer: String::new(),
            ready: VecDeque::new(),
            state: FramerState::Accumulating,
        }
    }

    pub fn state(&self) -> FramerState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, FramerState::Done | FramerState::Errored)
    }

    /// Text received but not yet part of a complete event.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Feeds one upstream read. Ignored once the framer is terminal.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.is_terminal() {
            return;
        }

        let text = self.decoder.decode(bytes);
        self.buffer.push_str(&text);
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut consumed = 0;
        while let Some(pos) = self.buffer[consumed..].find(EVENT_DELIMITER) {
            let raw = &self.buffer[consumed..consumed + pos];
            if !raw.trim().is_empty() {
                self.ready.push_back(raw.to_owned());
            }
            consumed += pos + EVENT_DELIMITER.len();
        }
        self.buffer.drain(..consumed);

        if !self.ready.is_empty() {
            self.state = FramerState::Emitting;
        }
    }

    /// Pops the next complete event. Reaching the sentinel moves the framer
    /// to [`FramerState::Done`] and discards everything after it.
    pub fn next_segment(&mut self) -> Option<Segment> {
        if self.is_terminal() {
            return None;
        }
        let Some(raw) = self.ready.pop_front() else {
            self.state = FramerState::Accumulating;
            return None;
        };

        let segment = classify(&raw);
        if segment == Segment::Done {
            self.state = FramerState::Done;
            self.ready.clear();
            self.buffer.clear();
        } else if self.ready.is_empty() {
            self.state = FramerState::Accumulating;
        }
        Some(segment)
    }

    /// Called when the upstream ended without a sentinel. Whatever is still
    /// buffered is treated as one final event. Queued events must have been
    /// drained with [`next_segment`](Self::next_segment) first.
    pub fn finish(&mut self) -> Option<Segment> {
        if self.is_terminal() {
            return None;
        }
        debug_assert!(self.ready.is_empty(), "finish() with undrained events");

        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);
        let rest = std::mem::take(&mut self.buffer);
        self.state = FramerState::Done;

        let rest = rest.trim_end_matches('\n');
        if rest.trim().is_empty() {
            None
        } else {
            Some(classify(rest))
        }
    }

    /// Marks the stream as failed. Buffered data is dropped.
    pub fn fail(&mut self) {
        self.state = FramerState::Errored;
        self.ready.clear();
        self.buffer.clear();
    }
}

fn classify(raw: &str) -> Segment {
    let mut data: Option<String> = None;
    for line in raw.lines() {
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(joined) => {
                joined.push('\n');
                joined.push_str(value);
            }
            None => data = Some(value.to_owned()),
        }
    }

    match data {
        None => Segment::Ignored,
        Some(payload) if payload.trim() == DONE_SENTINEL => Segment::Done,
        Some(payload) => Segment::Data(payload),
    }
}
