//! Inference session coordination for Bunny.
//!
//! Given a selected model, the [`Coordinator`]:
//!
//! - keeps the local inference server running with that model loaded
//!   ([`reconciler`]),
//! - streams replies into a [`Transcript`] with cancellation and
//!   regeneration ([`session`], [`typewriter`]),
//! - tracks model downloads and their progress ([`downloads`]).
//!
//! The inference server and model registry are owned by the control plane;
//! this crate only talks to it through [`bunny_client::ControlPlane`].

pub mod config;
pub mod coordinator;
pub mod downloads;
pub mod reconciler;
pub mod session;
pub mod transcript;
pub mod typewriter;

use std::sync::{Mutex, MutexGuard};

pub use config::{CoordinatorConfig, CoordinatorConfigBuilder};
pub use coordinator::{Coordinator, StatusReport};
pub use downloads::{progress, unix_now, DownloadError, DownloadTracker, JobProgress, PollReport};
pub use reconciler::{plan, DesiredServer, Plan, ReconcileOutcome, Reconciler, ServerControlError, Trigger};
pub use session::{SessionError, SessionHandle, SessionOutcome};
pub use transcript::{Transcript, TranscriptEvent, Turn, TurnId, TurnKind};
pub use typewriter::{Typewriter, TypewriterQueue};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
