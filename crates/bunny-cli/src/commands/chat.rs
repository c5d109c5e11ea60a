//! Interactive chat.

use std::io::Write;

use bunny_coordinator::SessionOutcome;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::{select, stream_reply, Bunny};

/// Chat with `model` until `/quit`, end of input, or Ctrl-C at the prompt.
pub(crate) async fn run(coordinator: &Bunny, model: &str) -> miette::Result<()> {
    select(coordinator, model).await?;

    let shutdown = CancellationToken::new();
    let pollers = coordinator.spawn_pollers(shutdown.clone());

    println!("Chatting with '{}'. /regen regenerates the last reply, /quit exits.", model);
    println!("Ctrl-C stops a reply in progress.");

    let result = repl(coordinator).await;

    shutdown.cancel();
    pollers.await.ok();
    result
}

async fn repl(coordinator: &Bunny) -> miette::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line
                .map_err(|e| miette::miette!("Failed to read input: {}", e))?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            return Ok(());
        };

        let input = line.trim();
        let events = coordinator.subscribe();
        let handle = match input {
            "" => continue,
            "/quit" | "/exit" => return Ok(()),
            "/regen" => coordinator.regenerate(),
            prompt => coordinator.send(prompt),
        };

        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("error: {}", e);
                continue;
            }
        };

        match stream_reply(coordinator, events, handle).await {
            SessionOutcome::NothingToRegenerate => println!("Nothing to regenerate yet."),
            SessionOutcome::Cancelled => println!("(cancelled)"),
            // Shown as an error turn while streaming.
            SessionOutcome::Failed(_) => {}
            SessionOutcome::Completed | SessionOutcome::FellBack => {}
        }
    }
}
