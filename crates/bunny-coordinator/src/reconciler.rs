//! Keeps the inference server running with the selected model.
//!
//! The coordinator never owns the server process. It compares what the user
//! wants ([`DesiredServer`]) with the last status reported by the control
//! plane and issues corrective stop/start calls. A pure [`plan`] decides what
//! to do; [`Reconciler`] executes it under a single-flight guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bunny_client::{ClientError, ControlPlane, ServerStatus, StartServerRequest};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The server the current selection calls for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredServer {
    /// Registry name sent to `/server/start`.
    pub model: String,
    /// Model file path, compared against the reported status.
    pub path: Option<String>,
    pub port: u16,
    pub ctx_size: u32,
}

impl DesiredServer {
    fn start_request(&self) -> StartServerRequest {
        StartServerRequest {
            model: self.model.clone(),
            port: self.port,
            ctx_size: self.ctx_size,
        }
    }
}

/// Corrective action for one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Nothing,
    Start,
    /// Stop the running server, then start the desired one.
    Restart,
}

/// Decide what to do given the desired and observed state.
///
/// `desired` is `None` when no model is selected or it is not installed.
pub fn plan(desired: Option<&DesiredServer>, status: &ServerStatus) -> Plan {
    let Some(desired) = desired else {
        return Plan::Nothing;
    };
    if !status.running {
        return Plan::Start;
    }
    match &desired.path {
        // Without a path there is nothing to compare against.
        None => Plan::Nothing,
        Some(path) if status.model.as_deref() == Some(path.as_str()) => Plan::Nothing,
        Some(_) => Plan::Restart,
    }
}

/// What initiated a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Selection, installed flag or observed status changed.
    Passive,
    /// The user is about to send a message.
    User,
}

#[derive(Debug, Error)]
pub enum ServerControlError {
    #[error("could not read server status: {0}")]
    Status(#[source] ClientError),

    #[error("failed to start '{model}': {source}")]
    Start {
        model: String,
        #[source]
        source: ClientError,
    },

    #[error("failed to stop server: {0}")]
    Stop(#[source] ClientError),
}

/// Result of one reconciliation attempt.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Another pass was in flight; this trigger was dropped.
    Skipped,
    /// The server already matches.
    Unchanged,
    /// A start was due but the one automatic start was already used.
    AutoStartSpent,
    Started,
    Restarted,
    Failed(ServerControlError),
}

impl ReconcileOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ReconcileOutcome::Failed(_))
    }
}

/// Single-flight executor for [`plan`].
#[derive(Debug)]
pub struct Reconciler {
    in_flight: AtomicBool,
    auto_start_used: AtomicBool,
    dirty: AtomicBool,
    settle: Duration,
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reconciler {
    /// `settle` is the pause between a stop and the following start.
    pub fn new(settle: Duration) -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            auto_start_used: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            settle,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take the flag set when a trigger was dropped during a pass.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Give up the automatic start, e.g. after the user stopped the server.
    pub fn consume_auto_start(&self) {
        self.auto_start_used.store(true, Ordering::Release);
    }

    /// Run one pass unless another is already running.
    pub async fn reconcile<C: ControlPlane + ?Sized>(
        &self,
        client: &C,
        desired: Option<&DesiredServer>,
        status: &ServerStatus,
        trigger: Trigger,
    ) -> ReconcileOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(?trigger, "reconciliation in flight, dropping trigger");
            self.dirty.store(true, Ordering::Release);
            return ReconcileOutcome::Skipped;
        }
        let _guard = FlightGuard(&self.in_flight);

        match plan(desired, status) {
            Plan::Nothing => ReconcileOutcome::Unchanged,
            Plan::Start => {
                let Some(desired) = desired else {
                    return ReconcileOutcome::Unchanged;
                };
                if trigger == Trigger::Passive
                    && self.auto_start_used.swap(true, Ordering::AcqRel)
                {
                    debug!(model = %desired.model, "automatic start already attempted");
                    return ReconcileOutcome::AutoStartSpent;
                }
                match self.start(client, desired).await {
                    Ok(()) => ReconcileOutcome::Started,
                    Err(e) => ReconcileOutcome::Failed(e),
                }
            }
            Plan::Restart => {
                let Some(desired) = desired else {
                    return ReconcileOutcome::Unchanged;
                };
                info!(
                    running = status.model.as_deref().unwrap_or("unknown"),
                    wanted = %desired.model,
                    "restarting inference server"
                );
                match client.stop_server().await.and_then(|ack| ack.into_result()) {
                    Ok(_) => {}
                    // The start below reports whatever is still wrong.
                    Err(e) => warn!(error = %e, "stop before restart failed"),
                }
                tokio::time::sleep(self.settle).await;
                match self.start(client, desired).await {
                    Ok(()) => ReconcileOutcome::Restarted,
                    Err(e) => ReconcileOutcome::Failed(e),
                }
            }
        }
    }

    async fn start<C: ControlPlane + ?Sized>(
        &self,
        client: &C,
        desired: &DesiredServer,
    ) -> Result<(), ServerControlError> {
        info!(model = %desired.model, port = desired.port, ctx_size = desired.ctx_size, "starting inference server");
        let ack = client
            .start_server(&desired.start_request())
            .await
            .and_then(|ack| ack.into_result())
            .map_err(|source| ServerControlError::Start {
                model: desired.model.clone(),
                source,
            })?;
        if let Some(note) = ack.note.as_deref() {
            debug!(note, "server start acknowledged");
        }
        Ok(())
    }
}
