//! One-shot prompt.

use bunny_coordinator::SessionOutcome;

use super::{select, stream_reply, Bunny};

pub(crate) async fn run(coordinator: &Bunny, model: &str, prompt: &str) -> miette::Result<()> {
    select(coordinator, model).await?;

    let events = coordinator.subscribe();
    let handle = coordinator
        .send(prompt)
        .map_err(|e| miette::miette!("{}", e))?;

    match stream_reply(coordinator, events, handle).await {
        // The error turn was already printed.
        SessionOutcome::Failed(_) => Err(miette::miette!("Generation failed")),
        SessionOutcome::Cancelled => Err(miette::miette!("Generation cancelled")),
        _ => Ok(()),
    }
}
