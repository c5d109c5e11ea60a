//! # Bunny Wire
//!
//! Decodes the body of a streaming chat response into text deltas.
//!
//! Inference backends disagree on how they frame streamed tokens. Some send
//! server-sent-event lines (`data: {...}`), some send bare JSON lines, and
//! some send raw tokens with no framing at all. [`FrameParser`] accepts all
//! of them and yields only the generated text.
//!
//! ## Example
//!
//! ```
//! use bunny_wire::FrameParser;
//!
//! let mut parser = FrameParser::new();
//! let feed = parser.feed("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\ndata: [DONE]\n");
//!
//! assert_eq!(feed.deltas, vec!["Hi".to_string()]);
//! assert!(feed.done);
//! ```

mod frame;
mod shapes;
mod utf8;

pub use frame::{Feed, FrameParser, DATA_MARKER, DONE_SENTINEL};
pub use shapes::{completion_text, extract_text, ShapeMatcher, SHAPES};
pub use utf8::Utf8Decoder;

/// Decode a complete sequence of chunks, returning every delta in order.
///
/// Emission stops at the completion sentinel; the trailing partial line, if
/// any, is flushed at the end.
pub fn decode_chunks<'a, I>(chunks: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut parser = FrameParser::new();
    let mut deltas = Vec::new();

    for chunk in chunks {
        let feed = parser.feed(chunk);
        deltas.extend(feed.deltas);
        if feed.done {
            return deltas;
        }
    }

    deltas.extend(parser.finish().deltas);
    deltas
}
