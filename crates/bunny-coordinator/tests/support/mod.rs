//! In-memory control plane for coordinator tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bunny_client::{
    Ack, ByteStream, ChatRequest, ClientError, ControlPlane, DownloadJob, Model, PullRequest,
    ServerStatus, StartServerRequest,
};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub const TINY_PATH: &str = "/models/tinyllama.gguf";
pub const PHI_PATH: &str = "/models/phi3.gguf";

/// How the next `/chat/stream` call responds.
pub enum StreamScript {
    Chunks(Vec<String>),
    /// Chunks pushed by the test as it runs.
    Channel(mpsc::UnboundedReceiver<Result<Bytes, ClientError>>),
    Fail { status: u16, message: String },
}

#[derive(Default)]
pub struct FakeControlPlane {
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<ChatRequest>>,
    models: Mutex<Vec<Model>>,
    status: Mutex<ServerStatus>,
    status_error: Mutex<Option<(u16, String)>>,
    streams: Mutex<VecDeque<StreamScript>>,
    chat_reply: Mutex<Option<Result<Value, (u16, String)>>>,
    start_gate: Mutex<Option<oneshot::Receiver<()>>>,
    jobs: Mutex<HashMap<String, DownloadJob>>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// tinyllama installed, phi3 available; server running tinyllama.
    pub fn with_tinyllama_running() -> Self {
        let fake = Self::new();
        fake.set_models(vec![
            Model::installed("tinyllama", TINY_PATH),
            Model::available("phi3"),
        ]);
        fake.set_status(ServerStatus::running(TINY_PATH));
        fake
    }

    pub fn set_models(&self, models: Vec<Model>) {
        *self.models.lock().unwrap() = models;
    }

    pub fn set_status(&self, status: ServerStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Make every `/server/status` call fail with this status.
    pub fn fail_status(&self, status: u16, message: &str) {
        *self.status_error.lock().unwrap() = Some((status, message.to_string()));
    }

    pub fn set_jobs(&self, jobs: Vec<DownloadJob>) {
        *self.jobs.lock().unwrap() = jobs.into_iter().map(|j| (j.id.clone(), j)).collect();
    }

    pub fn script_stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn script_chunks(&self, chunks: &[&str]) {
        self.script_stream(StreamScript::Chunks(
            chunks.iter().map(|c| c.to_string()).collect(),
        ));
    }

    /// Returns the sender feeding the next stream.
    pub fn script_channel(&self) -> mpsc::UnboundedSender<Result<Bytes, ClientError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script_stream(StreamScript::Channel(rx));
        tx
    }

    pub fn script_chat(&self, reply: Result<Value, (u16, String)>) {
        *self.chat_reply.lock().unwrap() = Some(reply);
    }

    /// Make the next `/server/start` wait until the returned sender fires.
    pub fn gate_start(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.start_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn path_of(&self, name: &str) -> Option<String> {
        self.models
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.name == name)
            .and_then(|m| m.path.clone())
    }
}

fn ok() -> Ack {
    Ack {
        ok: true,
        ..Ack::default()
    }
}

pub fn sse(content: &str) -> String {
    format!(
        "data: {}\n",
        serde_json::json!({"choices": [{"delta": {"content": content}}]})
    )
}

pub fn job(id: &str, model: &str, status: bunny_client::JobStatus) -> DownloadJob {
    DownloadJob {
        id: id.to_string(),
        model: model.to_string(),
        status,
        downloaded: 0,
        size: None,
        error: None,
        started_at: None,
        finished_at: None,
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_models(&self) -> Result<Vec<Model>, ClientError> {
        self.record("GET /models");
        Ok(self.models.lock().unwrap().clone())
    }

    async fn server_status(&self) -> Result<ServerStatus, ClientError> {
        self.record("GET /server/status");
        if let Some((status, message)) = self.status_error.lock().unwrap().clone() {
            return Err(ClientError::Api { status, message });
        }
        Ok(self.status.lock().unwrap().clone())
    }

    async fn start_server(&self, request: &StartServerRequest) -> Result<Ack, ClientError> {
        self.record(format!("POST /server/start {}", request.model));
        let gate = self.start_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let path = self.path_of(&request.model);
        self.set_status(ServerStatus {
            running: true,
            pid: Some(4242),
            port: Some(request.port),
            model: path,
            started_at: None,
        });
        Ok(ok())
    }

    async fn stop_server(&self) -> Result<Ack, ClientError> {
        self.record("POST /server/stop");
        let was_running = self.status.lock().unwrap().running;
        self.set_status(ServerStatus::not_running());
        if was_running {
            Ok(ok())
        } else {
            Ok(Ack {
                error: Some("No server running".to_string()),
                ..Ack::default()
            })
        }
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, ClientError> {
        self.record("POST /chat/stream");
        self.requests.lock().unwrap().push(request.clone());
        let script = self.streams.lock().unwrap().pop_front();
        match script {
            None => Ok(stream::empty().boxed()),
            Some(StreamScript::Chunks(chunks)) => Ok(stream::iter(
                chunks.into_iter().map(|c| Ok(Bytes::from(c))),
            )
            .boxed()),
            Some(StreamScript::Channel(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                let item = rx.recv().await?;
                Some((item, rx))
            })
            .boxed()),
            Some(StreamScript::Fail { status, message }) => Err(ClientError::Api { status, message }),
        }
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Value, ClientError> {
        self.record("POST /chat");
        self.requests.lock().unwrap().push(request.clone());
        match self.chat_reply.lock().unwrap().take() {
            Some(Ok(value)) => Ok(value),
            Some(Err((status, message))) => Err(ClientError::Api { status, message }),
            None => Ok(serde_json::json!({"choices": []})),
        }
    }

    async fn cancel_generation(&self) -> Result<Ack, ClientError> {
        self.record("POST /generation/cancel");
        Ok(ok())
    }

    async fn pull_model(&self, request: &PullRequest) -> Result<Ack, ClientError> {
        self.record(format!("POST /models/pull {}", request.model));
        let id = format!("job-{}", request.model);
        self.jobs.lock().unwrap().insert(
            id.clone(),
            job(&id, &request.model, bunny_client::JobStatus::Queued),
        );
        Ok(Ack {
            job_id: Some(id),
            ..ok()
        })
    }

    async fn active_downloads(&self) -> Result<HashMap<String, DownloadJob>, ClientError> {
        self.record("GET /downloads/active");
        Ok(self.jobs.lock().unwrap().clone())
    }

    async fn cancel_pull(&self, job_id: &str) -> Result<Ack, ClientError> {
        self.record(format!("POST /models/pull/cancel {}", job_id));
        let known = self.jobs.lock().unwrap().remove(job_id).is_some();
        if known {
            Ok(ok())
        } else {
            Err(ClientError::Api {
                status: 404,
                message: "Job not found".to_string(),
            })
        }
    }

    async fn retry_pull(&self, job_id: &str) -> Result<Ack, ClientError> {
        self.record(format!("POST /models/pull/retry {}", job_id));
        Ok(Ack {
            job_id: Some(format!("{}-retry", job_id)),
            ..ok()
        })
    }
}
