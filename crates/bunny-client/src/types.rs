//! Request and response bodies of the control-plane API.

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// A model known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Registry name; the model's identity.
    pub name: String,
    #[serde(default)]
    pub installed: bool,
    /// Size on disk in bytes, when installed.
    #[serde(default)]
    pub size: Option<u64>,
    /// Path of the model file, when installed.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub chat_format: Option<String>,
}

impl Model {
    /// An installed model at the given path.
    pub fn installed(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            installed: true,
            path: Some(path.into()),
            ..Self::available(name)
        }
    }

    /// A registry entry that is not yet downloaded.
    pub fn available(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installed: false,
            size: None,
            path: None,
            repo_id: None,
            filename: None,
            chat_format: None,
        }
    }
}

/// Snapshot of the inference server as reported by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Path of the loaded model file.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub started_at: Option<f64>,
}

impl ServerStatus {
    pub fn not_running() -> Self {
        Self::default()
    }

    /// A running server with `model` loaded.
    pub fn running(model: impl Into<String>) -> Self {
        Self {
            running: true,
            model: Some(model.into()),
            ..Self::default()
        }
    }
}

/// Lifecycle of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    #[serde(alias = "done")]
    Complete,
    #[serde(alias = "failed")]
    Error,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// Queued or running.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

/// A server-tracked model download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    #[serde(default)]
    pub id: String,
    pub model: String,
    pub status: JobStatus,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub finished_at: Option<f64>,
}

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Chat message in OpenAI format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Body of `/chat` and `/chat/stream`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    /// Registry name of the model the caller expects to be loaded.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

impl ChatRequest {
    /// The same payload with streaming turned off.
    pub fn non_streaming(&self) -> Self {
        Self {
            stream: false,
            ..self.clone()
        }
    }
}

/// Body of `/server/start`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartServerRequest {
    pub model: String,
    pub port: u16,
    pub ctx_size: u32,
}

/// Body of `/models/pull`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullRequest {
    pub model: String,
}

/// Body of `/models/pull/cancel`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct CancelPullRequest<'a> {
    pub job_id: &'a str,
}

/// Generic `{"ok": ...}` acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl Ack {
    /// Turn `ok: false` into [`ClientError::Rejected`].
    pub fn into_result(self) -> Result<Self, ClientError> {
        if self.ok {
            Ok(self)
        } else {
            let reason = self.reason().unwrap_or("no reason given").to_string();
            Err(ClientError::Rejected(reason))
        }
    }

    /// Explanation attached to the acknowledgement, if any.
    pub fn reason(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .or(self.note.as_deref())
    }
}
