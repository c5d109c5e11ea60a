//! Client for the Bunny inference control plane.
//!
//! The control plane is a small local HTTP API that owns the llama-server
//! process and the model download jobs. This crate exposes its endpoints as
//! the [`ControlPlane`] trait, implemented over HTTP by
//! [`ControlPlaneClient`].

mod client;
mod error;
mod types;

pub use client::{ByteStream, ControlPlane, ControlPlaneClient};
pub use error::ClientError;
pub use types::{
    Ack, ChatMessage, ChatRequest, DownloadJob, JobStatus, Model, PullRequest, Role,
    ServerStatus, StartServerRequest,
};

/// Default base URL of the control-plane API.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";

/// Default port the inference server listens on.
pub const DEFAULT_INFERENCE_PORT: u16 = 8081;

/// Default context size passed to the inference server.
pub const DEFAULT_CTX_SIZE: u32 = 2048;
