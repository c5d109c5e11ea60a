//! HTTP client for the control-plane API.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{error_message, ClientError};
use crate::types::{
    Ack, CancelPullRequest, ChatRequest, DownloadJob, Model, PullRequest, ServerStatus,
    StartServerRequest,
};
use crate::DEFAULT_API_URL;

/// Raw body of a streaming chat response.
pub type ByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

/// The control-plane endpoints the coordinator depends on.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// `GET /models`
    async fn list_models(&self) -> Result<Vec<Model>, ClientError>;

    /// `GET /server/status`
    async fn server_status(&self) -> Result<ServerStatus, ClientError>;

    /// `POST /server/start`
    async fn start_server(&self, request: &StartServerRequest) -> Result<Ack, ClientError>;

    /// `POST /server/stop`
    async fn stop_server(&self) -> Result<Ack, ClientError>;

    /// `POST /chat/stream`. Resolves once response headers arrive.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, ClientError>;

    /// `POST /chat`, returning the raw completion body.
    async fn chat(&self, request: &ChatRequest) -> Result<serde_json::Value, ClientError>;

    /// `POST /generation/cancel`
    async fn cancel_generation(&self) -> Result<Ack, ClientError>;

    /// `POST /models/pull`
    async fn pull_model(&self, request: &PullRequest) -> Result<Ack, ClientError>;

    /// `GET /downloads/active`, keyed by job id.
    async fn active_downloads(&self) -> Result<HashMap<String, DownloadJob>, ClientError>;

    /// `POST /models/pull/cancel`
    async fn cancel_pull(&self, job_id: &str) -> Result<Ack, ClientError>;

    /// `POST /models/pull/retry`
    async fn retry_pull(&self, job_id: &str) -> Result<Ack, ClientError>;
}

/// [`ControlPlane`] over HTTP.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    /// Create a client for the default local control plane.
    pub fn new() -> Self {
        Self::with_url(DEFAULT_API_URL)
    }

    /// Create a client with a custom base URL.
    pub fn with_url(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create a client for a control plane on a custom localhost port.
    pub fn with_port(port: u16) -> Self {
        Self::with_url(format!("http://127.0.0.1:{}/api", port))
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                ClientError::Unreachable(self.base_url.clone())
            } else {
                ClientError::Http(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = if text.trim().is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            error_message(&text)
        };
        debug!(status = status.as_u16(), %message, "control plane returned an error");
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = self.send(request).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Default for ControlPlaneClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn list_models(&self) -> Result<Vec<Model>, ClientError> {
        self.json(self.client.get(self.url("/models"))).await
    }

    async fn server_status(&self) -> Result<ServerStatus, ClientError> {
        self.json(self.client.get(self.url("/server/status"))).await
    }

    async fn start_server(&self, request: &StartServerRequest) -> Result<Ack, ClientError> {
        debug!(model = %request.model, port = request.port, "POST /server/start");
        self.json(self.client.post(self.url("/server/start")).json(request))
            .await
    }

    async fn stop_server(&self) -> Result<Ack, ClientError> {
        debug!("POST /server/stop");
        self.json(self.client.post(self.url("/server/stop"))).await
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, ClientError> {
        debug!(model = %request.model, messages = request.messages.len(), "POST /chat/stream");
        let response = self
            .send(self.client.post(self.url("/chat/stream")).json(request))
            .await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ClientError::from))
            .boxed())
    }

    async fn chat(&self, request: &ChatRequest) -> Result<serde_json::Value, ClientError> {
        debug!(model = %request.model, "POST /chat");
        self.json(self.client.post(self.url("/chat")).json(request))
            .await
    }

    async fn cancel_generation(&self) -> Result<Ack, ClientError> {
        self.json(self.client.post(self.url("/generation/cancel")))
            .await
    }

    async fn pull_model(&self, request: &PullRequest) -> Result<Ack, ClientError> {
        debug!(model = %request.model, "POST /models/pull");
        self.json(self.client.post(self.url("/models/pull")).json(request))
            .await
    }

    async fn active_downloads(&self) -> Result<HashMap<String, DownloadJob>, ClientError> {
        let mut jobs: HashMap<String, DownloadJob> =
            self.json(self.client.get(self.url("/downloads/active"))).await?;
        for (id, job) in jobs.iter_mut() {
            if job.id.is_empty() {
                job.id = id.clone();
            }
        }
        Ok(jobs)
    }

    async fn cancel_pull(&self, job_id: &str) -> Result<Ack, ClientError> {
        debug!(job_id, "POST /models/pull/cancel");
        let request = self
            .client
            .post(self.url("/models/pull/cancel"))
            .query(&[("job_id", job_id)])
            .json(&CancelPullRequest { job_id });
        self.json(request).await
    }

    async fn retry_pull(&self, job_id: &str) -> Result<Ack, ClientError> {
        debug!(job_id, "POST /models/pull/retry");
        let request = self
            .client
            .post(self.url("/models/pull/retry"))
            .query(&[("job_id", job_id)]);
        self.json(request).await
    }
}
