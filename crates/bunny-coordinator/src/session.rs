//! One streaming chat generation.

use std::sync::Mutex;

use bunny_client::{ChatRequest, ControlPlane};
use bunny_wire::{completion_text, Feed, FrameParser, Utf8Decoder};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lock;
use crate::transcript::{Transcript, TurnId};
use crate::typewriter::Typewriter;

/// Reasons a generation is refused before any request is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no model selected")]
    NoModelSelected,

    #[error("model '{0}' is not installed")]
    ModelNotInstalled(String),

    #[error("a generation is already in progress")]
    Busy,

    #[error("prompt is empty")]
    EmptyPrompt,
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The stream produced text.
    Completed,
    /// The stream was empty and the non-streaming request answered.
    FellBack,
    Cancelled,
    /// An error turn was added with this message.
    Failed(String),
    /// There was no user turn to regenerate from.
    NothingToRegenerate,
}

/// A started (or immediately resolved) generation.
#[derive(Debug)]
pub struct SessionHandle {
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Running(JoinHandle<SessionOutcome>),
    Finished(SessionOutcome),
}

impl SessionHandle {
    pub(crate) fn running(handle: JoinHandle<SessionOutcome>) -> Self {
        Self {
            state: HandleState::Running(handle),
        }
    }

    pub(crate) fn finished(outcome: SessionOutcome) -> Self {
        Self {
            state: HandleState::Finished(outcome),
        }
    }

    /// Wait for the generation to end.
    pub async fn outcome(self) -> SessionOutcome {
        match self.state {
            HandleState::Finished(outcome) => outcome,
            HandleState::Running(handle) => match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => SessionOutcome::Cancelled,
                Err(e) => SessionOutcome::Failed(format!("generation task failed: {}", e)),
            },
        }
    }
}

/// The in-flight request for one assistant turn.
#[derive(Debug)]
pub(crate) struct Session {
    pub request: ChatRequest,
    pub target: TurnId,
    pub token: CancellationToken,
}

impl Session {
    pub async fn run<C: ControlPlane + ?Sized>(
        self,
        client: &C,
        typewriter: &Typewriter,
        transcript: &Mutex<Transcript>,
    ) -> SessionOutcome {
        info!(model = %self.request.model, turn = %self.target, "generation started");
        let outcome = self.stream(client, typewriter, transcript).await;
        match &outcome {
            SessionOutcome::Failed(message) => warn!(turn = %self.target, %message, "generation failed"),
            other => info!(turn = %self.target, outcome = ?other, "generation finished"),
        }
        outcome
    }

    async fn stream<C: ControlPlane + ?Sized>(
        &self,
        client: &C,
        typewriter: &Typewriter,
        transcript: &Mutex<Transcript>,
    ) -> SessionOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return SessionOutcome::Cancelled,
            opened = client.chat_stream(&self.request) => opened,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(e) => return self.fail(transcript, false, e.to_string()),
        };

        let mut decoder = Utf8Decoder::new();
        let mut parser = FrameParser::new();
        let mut produced = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return SessionOutcome::Cancelled,
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    let text = decoder.decode(&bytes);
                    let feed = parser.feed(&text);
                    if !self.deliver(typewriter, &feed, &mut produced) {
                        return SessionOutcome::Cancelled;
                    }
                    if feed.done {
                        debug!(turn = %self.target, "stream sentinel received");
                        break;
                    }
                }
                Some(Err(e)) => return self.fail(transcript, produced, e.to_string()),
                None => {
                    let tail = decoder.finish();
                    let mut feed = parser.feed(&tail);
                    feed.deltas.extend(parser.finish().deltas);
                    if !self.deliver(typewriter, &feed, &mut produced) {
                        return SessionOutcome::Cancelled;
                    }
                    break;
                }
            }
        }
        // Drop the transport before any follow-up request.
        drop(body);

        if produced {
            return SessionOutcome::Completed;
        }
        self.fallback(client, typewriter, transcript).await
    }

    async fn fallback<C: ControlPlane + ?Sized>(
        &self,
        client: &C,
        typewriter: &Typewriter,
        transcript: &Mutex<Transcript>,
    ) -> SessionOutcome {
        info!(turn = %self.target, "stream was empty, retrying without streaming");
        let request = self.request.non_streaming();
        let reply = tokio::select! {
            biased;
            _ = self.token.cancelled() => return SessionOutcome::Cancelled,
            reply = client.chat(&request) => reply,
        };

        match reply {
            Ok(body) => match completion_text(&body).filter(|text| !text.is_empty()) {
                Some(text) => {
                    if typewriter.enqueue(self.target, &self.token, &text) {
                        SessionOutcome::FellBack
                    } else {
                        SessionOutcome::Cancelled
                    }
                }
                None => self.fail(transcript, false, "the model returned an empty reply".to_string()),
            },
            Err(e) => self.fail(transcript, false, e.to_string()),
        }
    }

    /// Route deltas through the typewriter. `false` once the session is cancelled.
    fn deliver(&self, typewriter: &Typewriter, feed: &Feed, produced: &mut bool) -> bool {
        for delta in &feed.deltas {
            if delta.is_empty() {
                continue;
            }
            if !typewriter.enqueue(self.target, &self.token, delta) {
                return false;
            }
            *produced = true;
        }
        true
    }

    fn fail(&self, transcript: &Mutex<Transcript>, produced: bool, message: String) -> SessionOutcome {
        // Cancellation happens under the transcript lock.
        let mut transcript = lock(transcript);
        if self.token.is_cancelled() {
            return SessionOutcome::Cancelled;
        }
        if produced {
            // Text for the target may still be queued; keep the error separate.
            transcript.push_error(message.clone());
        } else {
            transcript.fail(self.target, message.clone());
        }
        SessionOutcome::Failed(message)
    }
}
