//! Error types for control-plane requests.

use thiserror::Error;

/// Errors that can occur while talking to the control plane.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// Server answered 2xx but reported `ok: false`.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Control plane is not reachable.
    #[error("control plane not reachable at {0}")]
    Unreachable(String),
}

impl ClientError {
    /// HTTP status code, when the server produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Pull a human-readable message out of an error body.
///
/// FastAPI wraps errors as `{"detail": ...}`; other handlers use
/// `{"error": ...}`. Anything else is returned as-is.
pub(crate) fn error_message(body: &str) -> String {
    let value = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => value,
        Err(_) => return body.trim().to_string(),
    };

    let field = value.get("detail").or_else(|| value.get("error"));
    match field {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Object(map)) => map
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| serde_json::Value::Object(map.clone()).to_string()),
        _ => body.trim().to_string(),
    }
}
