//! CLI commands.

pub mod ask;
pub mod chat;
pub mod downloads;
pub mod models;
pub mod pull;
pub mod server;

use std::io::Write;

use bunny_client::ControlPlaneClient;
use bunny_coordinator::{Coordinator, ReconcileOutcome, SessionHandle, SessionOutcome, TranscriptEvent};
use tokio::sync::broadcast;

pub(crate) type Bunny = Coordinator<ControlPlaneClient>;

/// Select `model` and make sure the server is running it.
pub(crate) async fn select(coordinator: &Bunny, model: &str) -> miette::Result<ReconcileOutcome> {
    let models = coordinator
        .refresh_models()
        .await
        .map_err(|e| miette::miette!("Failed to list models: {}", e))?;

    match models.iter().find(|m| m.name == model) {
        None => return Err(miette::miette!("Unknown model: {}", model)),
        Some(m) if !m.installed => {
            return Err(miette::miette!(
                "Model '{}' is not installed. To download it, run:\n  bunny pull {}",
                model,
                model
            ))
        }
        Some(_) => {}
    }

    let outcome = match coordinator.select_model(Some(model)).await {
        ReconcileOutcome::AutoStartSpent | ReconcileOutcome::Skipped => {
            coordinator.ensure_server().await
        }
        outcome => outcome,
    };
    match outcome {
        ReconcileOutcome::Failed(e) => Err(miette::miette!("{}", e)),
        outcome => Ok(outcome),
    }
}

/// Print a generation as it streams. Ctrl-C cancels it.
pub(crate) async fn stream_reply(
    coordinator: &Bunny,
    mut events: broadcast::Receiver<TranscriptEvent>,
    handle: SessionHandle,
) -> SessionOutcome {
    let idle = coordinator.wait_idle();
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => render(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "transcript events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut idle => break,
            _ = tokio::signal::ctrl_c() => {
                coordinator.cancel();
            }
        }
    }
    while let Ok(event) = events.try_recv() {
        render(&event);
    }
    println!();

    handle.outcome().await
}

fn render(event: &TranscriptEvent) {
    match event {
        TranscriptEvent::Delta { text, .. } => {
            print!("{}", text);
            std::io::stdout().flush().ok();
        }
        TranscriptEvent::Pushed(turn) | TranscriptEvent::Updated(turn) if turn.is_error() => {
            eprintln!();
            eprintln!("error: {}", turn.content);
        }
        _ => {}
    }
}

/// Human-readable byte count.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
