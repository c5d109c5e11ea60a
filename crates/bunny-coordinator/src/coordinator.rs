//! The session coordinator facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bunny_client::{
    ChatMessage, ChatRequest, ClientError, ControlPlane, DownloadJob, Model, Role, ServerStatus,
};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::downloads::{DownloadError, DownloadTracker};
use crate::lock;
use crate::reconciler::{DesiredServer, ReconcileOutcome, Reconciler, ServerControlError, Trigger};
use crate::session::{Session, SessionError, SessionHandle, SessionOutcome};
use crate::transcript::{Transcript, TranscriptEvent, Turn, TurnId};
use crate::typewriter::Typewriter;

/// Result of one status poll.
#[derive(Debug)]
pub struct StatusReport {
    pub status: ServerStatus,
    /// Set when the poll triggered a reconciliation pass.
    pub reconciled: Option<ReconcileOutcome>,
}

#[derive(Debug, Default)]
struct Selection {
    selected: Option<String>,
    models: Vec<Model>,
    status: Option<ServerStatus>,
}

#[derive(Debug)]
struct ActiveSession {
    id: u64,
    token: CancellationToken,
}

struct Shared<C> {
    client: Arc<C>,
    config: CoordinatorConfig,
    selection: Mutex<Selection>,
    transcript: Arc<Mutex<Transcript>>,
    typewriter: Typewriter,
    reconciler: Reconciler,
    downloads: DownloadTracker,
    active: Mutex<Option<ActiveSession>>,
    next_session: AtomicU64,
    session_ended: Notify,
}

/// Owns the selection, transcript, active generation and download state.
///
/// Cheap to clone; clones share state.
pub struct Coordinator<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Coordinator<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: ControlPlane + 'static> Coordinator<C> {
    pub fn new(client: C, config: CoordinatorConfig) -> Self {
        let transcript = Arc::new(Mutex::new(Transcript::new()));
        let typewriter = Typewriter::new(
            Arc::clone(&transcript),
            config.typewriter_slice,
            config.typewriter_tick,
        );
        Self {
            shared: Arc::new(Shared {
                client: Arc::new(client),
                reconciler: Reconciler::new(config.stop_settle),
                config,
                selection: Mutex::new(Selection::default()),
                transcript,
                typewriter,
                downloads: DownloadTracker::new(),
                active: Mutex::new(None),
                next_session: AtomicU64::new(0),
                session_ended: Notify::new(),
            }),
        }
    }

    pub fn client(&self) -> &C {
        &self.shared.client
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn models(&self) -> Vec<Model> {
        lock(&self.shared.selection).models.clone()
    }

    pub fn selected_model(&self) -> Option<String> {
        lock(&self.shared.selection).selected.clone()
    }

    /// Last status seen by a poll.
    pub fn server_status(&self) -> Option<ServerStatus> {
        lock(&self.shared.selection).status.clone()
    }

    pub fn transcript(&self) -> Vec<Turn> {
        lock(&self.shared.transcript).turns().to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        lock(&self.shared.transcript).subscribe()
    }

    pub fn is_generating(&self) -> bool {
        lock(&self.shared.active).is_some()
    }

    /// The server the current selection calls for, if any.
    fn desired(&self) -> Option<DesiredServer> {
        let selection = lock(&self.shared.selection);
        let name = selection.selected.as_deref()?;
        let model = selection
            .models
            .iter()
            .find(|m| m.name == name && m.installed)?;
        Some(DesiredServer {
            model: model.name.clone(),
            path: model.path.clone(),
            port: self.shared.config.port,
            ctx_size: self.shared.config.ctx_size,
        })
    }

    async fn reconcile(&self, status: &ServerStatus, trigger: Trigger) -> ReconcileOutcome {
        let desired = self.desired();
        let outcome = self
            .shared
            .reconciler
            .reconcile(&*self.shared.client, desired.as_ref(), status, trigger)
            .await;
        match &outcome {
            ReconcileOutcome::Failed(e) => warn!(error = %e, "reconciliation failed"),
            other => debug!(outcome = ?other, "reconciliation pass"),
        }
        outcome
    }

    /// Status from the last poll, fetching it if none was seen yet.
    async fn observed_status(&self) -> Result<ServerStatus, ClientError> {
        if let Some(status) = self.server_status() {
            return Ok(status);
        }
        let status = self.shared.client.server_status().await?;
        lock(&self.shared.selection).status = Some(status.clone());
        Ok(status)
    }

    /// Fetch `/models`. Reconciles if the selected model's installed flag flipped.
    pub async fn refresh_models(&self) -> Result<Vec<Model>, ClientError> {
        let models = self.shared.client.list_models().await?;
        let flipped = {
            let mut selection = lock(&self.shared.selection);
            let installed = |models: &[Model], name: Option<&str>| {
                name.and_then(|n| models.iter().find(|m| m.name == n))
                    .map(|m| m.installed)
                    .unwrap_or(false)
            };
            let name = selection.selected.clone();
            let before = installed(&selection.models, name.as_deref());
            let after = installed(&models, name.as_deref());
            selection.models = models.clone();
            name.is_some() && before != after
        };

        if flipped {
            info!("selected model's installed flag changed");
            if let Some(status) = self.server_status() {
                self.reconcile(&status, Trigger::Passive).await;
            }
        }
        Ok(models)
    }

    /// Change the selected model and reconcile the server against it.
    pub async fn select_model(&self, name: Option<&str>) -> ReconcileOutcome {
        let changed = {
            let mut selection = lock(&self.shared.selection);
            let changed = selection.selected.as_deref() != name;
            selection.selected = name.map(str::to_string);
            changed
        };
        if !changed {
            return ReconcileOutcome::Unchanged;
        }
        info!(model = name.unwrap_or("none"), "model selected");

        match self.observed_status().await {
            Ok(status) => self.reconcile(&status, Trigger::Passive).await,
            Err(e) => ReconcileOutcome::Failed(ServerControlError::Status(e)),
        }
    }

    /// Poll `/server/status`. Reconciles when the status changed or a trigger
    /// was dropped since the last pass.
    pub async fn poll_status(&self) -> Result<StatusReport, ClientError> {
        let status = self.shared.client.server_status().await?;
        let changed = {
            let mut selection = lock(&self.shared.selection);
            let changed = selection.status.as_ref() != Some(&status);
            selection.status = Some(status.clone());
            changed
        };

        let dirty = self.shared.reconciler.take_dirty();
        let reconciled = if changed || dirty {
            Some(self.reconcile(&status, Trigger::Passive).await)
        } else {
            None
        };
        Ok(StatusReport { status, reconciled })
    }

    /// Reconcile now on the user's behalf, with a fresh status.
    pub async fn ensure_server(&self) -> ReconcileOutcome {
        let status = match self.shared.client.server_status().await {
            Ok(status) => status,
            Err(e) => return ReconcileOutcome::Failed(ServerControlError::Status(e)),
        };
        lock(&self.shared.selection).status = Some(status.clone());
        self.reconcile(&status, Trigger::User).await
    }

    /// Stop the inference server. Also gives up the automatic start.
    pub async fn stop_server(&self) -> Result<(), ServerControlError> {
        self.shared.reconciler.consume_auto_start();
        self.shared
            .client
            .stop_server()
            .await
            .and_then(|ack| ack.into_result())
            .map_err(ServerControlError::Stop)?;
        info!("inference server stopped");
        Ok(())
    }

    /// Poll `/downloads/active`. Refreshes models when a download finished.
    pub async fn poll_downloads(&self) -> Result<Vec<String>, DownloadError> {
        let report = self.shared.downloads.poll(&*self.shared.client).await?;
        if !report.finished.is_empty() {
            if let Err(e) = self.refresh_models().await {
                warn!(error = %e, "model refresh after download failed");
            }
        }
        Ok(report.finished)
    }

    pub fn downloads(&self) -> Vec<DownloadJob> {
        self.shared.downloads.jobs()
    }

    pub fn is_downloading(&self, model: &str) -> bool {
        self.shared.downloads.is_downloading(model)
    }

    pub async fn start_download(&self, model: &str) -> Result<String, DownloadError> {
        self.shared.downloads.start(&*self.shared.client, model).await
    }

    pub async fn cancel_download(&self, model: &str) -> Result<(), DownloadError> {
        self.shared.downloads.cancel(&*self.shared.client, model).await
    }

    pub async fn retry_download(&self, job_id: &str) -> Result<String, DownloadError> {
        self.shared.downloads.retry(&*self.shared.client, job_id).await
    }

    fn require_model(&self) -> Result<String, SessionError> {
        let selection = lock(&self.shared.selection);
        let name = selection
            .selected
            .clone()
            .ok_or(SessionError::NoModelSelected)?;
        match selection.models.iter().find(|m| m.name == name) {
            Some(model) if model.installed => Ok(name),
            _ => Err(SessionError::ModelNotInstalled(name)),
        }
    }

    fn request(&self, model: String, messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model,
            messages,
            max_tokens: self.shared.config.max_tokens,
            temperature: self.shared.config.temperature,
            stream: true,
        }
    }

    /// Send a user message and stream the reply into a new assistant turn.
    ///
    /// Must be called from within a tokio runtime.
    pub fn send(&self, prompt: &str) -> Result<SessionHandle, SessionError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        let model = self.require_model()?;

        let mut active = lock(&self.shared.active);
        if active.is_some() {
            return Err(SessionError::Busy);
        }
        let (target, messages) = {
            let mut transcript = lock(&self.shared.transcript);
            transcript.push(Role::User, prompt);
            let target = transcript.push(Role::Assistant, "");
            let end = transcript.turns().len();
            (target, transcript.messages(end, &self.shared.config.system_prompt))
        };

        let request = self.request(model, messages);
        Ok(self.begin(&mut active, request, target))
    }

    /// Re-run the reply to the most recent user message.
    pub fn regenerate(&self) -> Result<SessionHandle, SessionError> {
        let mut active = lock(&self.shared.active);
        if active.is_some() {
            return Err(SessionError::Busy);
        }
        if lock(&self.shared.transcript).last_user_index().is_none() {
            return Ok(SessionHandle::finished(SessionOutcome::NothingToRegenerate));
        }
        let model = self.require_model()?;

        let Some((target, messages)) = ({
            let mut transcript = lock(&self.shared.transcript);
            transcript.last_user_index().map(|index| {
                let target = transcript.reset_reply(index);
                let messages = transcript.messages(index + 1, &self.shared.config.system_prompt);
                (target, messages)
            })
        }) else {
            return Ok(SessionHandle::finished(SessionOutcome::NothingToRegenerate));
        };

        let request = self.request(model, messages);
        Ok(self.begin(&mut active, request, target))
    }

    fn begin(
        &self,
        active: &mut Option<ActiveSession>,
        request: ChatRequest,
        target: TurnId,
    ) -> SessionHandle {
        // Best effort; the stream reports whatever is still wrong.
        let this = self.clone();
        tokio::spawn(async move {
            this.ensure_server().await;
        });

        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        *active = Some(ActiveSession {
            id,
            token: token.clone(),
        });

        let session = Session {
            request,
            target,
            token,
        };
        let this = self.clone();
        SessionHandle::running(tokio::spawn(async move {
            let shared = &this.shared;
            let outcome = session
                .run(&*shared.client, &shared.typewriter, &shared.transcript)
                .await;
            this.end_session(id);
            outcome
        }))
    }

    fn end_session(&self, id: u64) {
        let mut active = lock(&self.shared.active);
        if active.as_ref().map(|s| s.id) == Some(id) {
            *active = None;
        }
        drop(active);
        self.shared.session_ended.notify_waiters();
    }

    /// Abort the active generation. Returns `false` if there was none.
    ///
    /// Once this returns, no further text reaches the transcript from the
    /// aborted session.
    pub fn cancel(&self) -> bool {
        let Some(session) = lock(&self.shared.active).take() else {
            return false;
        };
        {
            // Held so an error turn cannot race the cancellation.
            let _transcript = lock(&self.shared.transcript);
            session.token.cancel();
        }
        self.shared.typewriter.clear();
        self.shared.session_ended.notify_waiters();
        info!(session = session.id, "generation cancelled");

        let client = Arc::clone(&self.shared.client);
        tokio::spawn(async move {
            match client.cancel_generation().await {
                Ok(ack) if !ack.ok => {
                    debug!(reason = ack.reason().unwrap_or(""), "backend declined cancel")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "generation cancel signal failed"),
            }
        });
        true
    }

    /// Resolve once no generation is active and the typewriter has drained.
    pub async fn wait_idle(&self) {
        loop {
            let ended = self.shared.session_ended.notified();
            tokio::pin!(ended);
            ended.as_mut().enable();
            if !self.is_generating() {
                break;
            }
            ended.await;
        }
        self.shared.typewriter.wait_idle().await;
    }

    /// Poll server status and downloads on their configured intervals until
    /// `shutdown` is cancelled.
    pub fn spawn_pollers(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut status_tick = tokio::time::interval(this.shared.config.status_interval);
            let mut jobs_tick = tokio::time::interval(this.shared.config.jobs_interval);
            status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            jobs_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = status_tick.tick() => {
                        if let Err(e) = this.poll_status().await {
                            debug!(error = %e, "status poll failed");
                        }
                    }
                    _ = jobs_tick.tick() => {
                        if let Err(e) = this.poll_downloads().await {
                            debug!(error = %e, "download poll failed");
                        }
                    }
                }
            }
            debug!("pollers stopped");
        })
    }
}
