//! Response-shape matchers for JSON frames.
//!
//! Each matcher recognises one backend response format and pulls the
//! generated text out of it. Matchers are tried in order; the first one that
//! recognises the value wins.

use serde_json::Value;

/// A matcher for one JSON response shape.
///
/// Returns `None` when the value is not in this shape. A recognised frame
/// that carries no text returns `Some(String::new())`.
pub type ShapeMatcher = fn(&Value) -> Option<String>;

/// Known response shapes, in priority order.
pub const SHAPES: &[ShapeMatcher] = &[choices_text, top_level_text, top_level_content];

/// Extract text from a decoded JSON frame using [`SHAPES`].
pub fn extract_text(value: &Value) -> Option<String> {
    SHAPES.iter().find_map(|matcher| matcher(value))
}

/// Extract the full text of a non-streaming completion body.
pub fn completion_text(value: &Value) -> Option<String> {
    extract_text(value)
}

/// OpenAI-style `choices` list, streamed or not.
fn choices_text(value: &Value) -> Option<String> {
    let choices = value.get("choices")?.as_array()?;

    if choices.is_empty() {
        // Usage-only trailer frames carry an empty list.
        return Some(String::new());
    }

    let mut recognised = false;
    let mut text = String::new();
    for choice in choices.iter().filter_map(Value::as_object) {
        recognised = true;
        if let Some(part) = choice_text(choice) {
            text.push_str(part);
        }
    }

    recognised.then_some(text)
}

fn choice_text(choice: &serde_json::Map<String, Value>) -> Option<&str> {
    if let Some(delta) = choice.get("delta").and_then(Value::as_object) {
        if let Some(text) = str_field(delta, "content").or_else(|| str_field(delta, "text")) {
            return Some(text);
        }
    }

    if let Some(message) = choice.get("message").and_then(Value::as_object) {
        match message.get("content") {
            Some(Value::String(text)) => return Some(text),
            Some(Value::Object(content)) => {
                if let Some(text) = str_field(content, "text") {
                    return Some(text);
                }
            }
            _ => {}
        }
    }

    str_field(choice, "text").or_else(|| str_field(choice, "content"))
}

fn top_level_text(value: &Value) -> Option<String> {
    value.get("text")?.as_str().map(str::to_string)
}

fn top_level_content(value: &Value) -> Option<String> {
    value.get("content")?.as_str().map(str::to_string)
}

fn str_field<'a>(map: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}
