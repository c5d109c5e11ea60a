//! Line framing and frame decoding.

use tracing::trace;

use crate::shapes::extract_text;

/// Prefix marking a server-sent-event data line.
pub const DATA_MARKER: &str = "data:";

/// Payload that ends a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Result of feeding one chunk to a [`FrameParser`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Feed {
    /// Decoded text, in arrival order. Never contains empty strings.
    pub deltas: Vec<String>,
    /// The completion sentinel was seen; later input is ignored.
    pub done: bool,
}

/// What a single line decoded to.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Empty,
    Done,
    Text(String),
}

/// Incremental decoder for a streaming chat body.
///
/// Holds the partial trailing line between chunks.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: String,
    done: bool,
}

impl FrameParser {
    /// Create a parser with an empty carry-over buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The partial line carried over to the next chunk.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Whether the completion sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode one chunk of the response body.
    pub fn feed(&mut self, chunk: &str) -> Feed {
        let mut feed = Feed {
            deltas: Vec::new(),
            done: self.done,
        };
        if self.done || chunk.is_empty() {
            return feed;
        }

        // Bare tokens: no framing at all.
        if self.buffer.is_empty() && !chunk.contains('\n') && !is_framed(chunk) {
            if is_sentinel(chunk.trim()) {
                self.done = true;
                feed.done = true;
            } else {
                feed.deltas.push(chunk.to_string());
            }
            return feed;
        }

        self.buffer.push_str(chunk);
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            match decode_line(&line) {
                Frame::Empty => {}
                Frame::Text(text) => feed.deltas.push(text),
                Frame::Done => {
                    self.finish_with_sentinel();
                    feed.done = true;
                    return feed;
                }
            }
        }

        feed
    }

    /// Flush the buffered partial line at end of stream.
    pub fn finish(&mut self) -> Feed {
        let mut feed = Feed {
            deltas: Vec::new(),
            done: self.done,
        };
        if self.done {
            return feed;
        }

        let line = std::mem::take(&mut self.buffer);
        match decode_line(&line) {
            Frame::Empty => {}
            Frame::Text(text) => feed.deltas.push(text),
            Frame::Done => {
                self.done = true;
                feed.done = true;
            }
        }
        feed
    }

    fn finish_with_sentinel(&mut self) {
        self.done = true;
        self.buffer.clear();
    }
}

fn is_framed(chunk: &str) -> bool {
    chunk.trim_start().starts_with(DATA_MARKER)
}

fn is_sentinel(payload: &str) -> bool {
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| payload.strip_prefix(*q).and_then(|p| p.strip_suffix(*q)))
        .unwrap_or(payload);
    unquoted.trim().eq_ignore_ascii_case(DONE_SENTINEL)
}

fn decode_line(line: &str) -> Frame {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let payload = match line.trim_start().strip_prefix(DATA_MARKER) {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => line,
    };
    // Whitespace-only payloads are text (indentation, spacing).
    if payload.is_empty() {
        return Frame::Empty;
    }

    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Frame::Text(payload.to_string());
    }
    if is_sentinel(trimmed) {
        return Frame::Done;
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => match extract_text(&value) {
            Some(text) if text.is_empty() => Frame::Empty,
            Some(text) => Frame::Text(text),
            None => {
                trace!("unrecognised JSON frame, forwarding raw");
                Frame::Text(payload.to_string())
            }
        },
        Err(_) => Frame::Text(payload.to_string()),
    }
}
