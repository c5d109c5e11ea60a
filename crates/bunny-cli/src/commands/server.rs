//! Inference server commands.

use bunny_coordinator::{unix_now, ReconcileOutcome};

use super::{select, Bunny};

/// Show the inference server status.
pub(crate) async fn status(coordinator: &Bunny) -> miette::Result<()> {
    let report = coordinator
        .poll_status()
        .await
        .map_err(|e| miette::miette!("Failed to read server status: {}", e))?;
    let status = report.status;

    println!("Control plane:    {}", coordinator.client().base_url());
    if !status.running {
        println!("Inference server: stopped");
        return Ok(());
    }

    println!("Inference server: running");
    if let Some(model) = &status.model {
        println!("  Model: {}", model);
    }
    if let Some(pid) = status.pid {
        println!("  PID:   {}", pid);
    }
    if let Some(port) = status.port {
        println!("  Port:  {}", port);
    }
    if let Some(started_at) = status.started_at {
        let uptime = (unix_now() - started_at).max(0.0);
        println!("  Up:    {}s", uptime.round() as u64);
    }
    Ok(())
}

/// Start the inference server with `model` loaded.
pub(crate) async fn start(coordinator: &Bunny, model: &str) -> miette::Result<()> {
    match select(coordinator, model).await? {
        ReconcileOutcome::Unchanged => println!("Inference server is already running '{}'.", model),
        ReconcileOutcome::Restarted => println!("Inference server restarted with '{}'.", model),
        _ => println!("Inference server started with '{}'.", model),
    }
    println!("Port: {}", coordinator.config().port);
    Ok(())
}

/// Stop the inference server.
pub(crate) async fn stop(coordinator: &Bunny) -> miette::Result<()> {
    coordinator
        .stop_server()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Inference server stopped.");
    Ok(())
}
