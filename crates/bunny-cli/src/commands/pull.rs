//! Model download with a progress bar.

use bunny_client::{ControlPlane, DownloadJob, JobStatus};
use bunny_coordinator::{progress, unix_now, DownloadError};
use indicatif::{ProgressBar, ProgressStyle};

use super::{format_bytes, Bunny};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes} downloaded {msg}";

/// Pull `model` and follow the job until it ends. Ctrl-C cancels the job.
pub(crate) async fn run(coordinator: &Bunny, model: &str) -> miette::Result<()> {
    let models = coordinator
        .refresh_models()
        .await
        .map_err(|e| miette::miette!("Failed to list models: {}", e))?;
    if models.iter().any(|m| m.name == model && m.installed) {
        println!("Model '{}' is already installed.", model);
        return Ok(());
    }

    let job_id = coordinator
        .start_download(model)
        .await
        .map_err(|e| miette::miette!("Failed to start download: {}", e))?;
    println!("Downloading model: {} (job {})", model, job_id);

    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template(SPINNER_TEMPLATE) {
        pb.set_style(style);
    }

    let mut tick = tokio::time::interval(coordinator.config().jobs_interval);
    let mut sized = false;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                pb.abandon_with_message("cancelling");
                cancel(coordinator, model, &job_id).await?;
                println!("Download cancelled.");
                return Ok(());
            }
        }

        let finished = coordinator
            .poll_downloads()
            .await
            .map_err(|e| miette::miette!("Failed to poll downloads: {}", e))?;
        let job = coordinator.downloads().into_iter().find(|j| j.id == job_id);

        match job {
            Some(job) => {
                if !sized {
                    if let Some(size) = job.size.filter(|&s| s > 0) {
                        pb.set_length(size);
                        if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
                            pb.set_style(style.progress_chars("#>-"));
                        }
                        sized = true;
                    }
                }
                pb.set_position(job.downloaded);
                pb.set_message(rate(&job));

                match job.status {
                    JobStatus::Queued | JobStatus::Running | JobStatus::Unknown => {}
                    JobStatus::Complete => break,
                    JobStatus::Cancelled => {
                        pb.abandon();
                        return Err(miette::miette!("Download of '{}' was cancelled", model));
                    }
                    JobStatus::Error => {
                        pb.abandon();
                        return Err(miette::miette!(
                            "Failed to download model: {}\nTo retry, run:\n  bunny downloads --retry {}",
                            job.error.as_deref().unwrap_or("unknown error"),
                            job.id
                        ));
                    }
                }
            }
            // Finished jobs may drop out of the active list.
            None if finished.iter().any(|m| m == model) => break,
            None => {}
        }
    }

    pb.finish_and_clear();
    let installed = coordinator
        .refresh_models()
        .await
        .map_err(|e| miette::miette!("Failed to list models: {}", e))?
        .into_iter()
        .find(|m| m.name == model && m.installed);

    match installed {
        Some(m) => {
            println!("Model downloaded successfully!");
            if let Some(path) = &m.path {
                println!("Location: {}", path);
            }
            Ok(())
        }
        None => Err(miette::miette!(
            "Download of '{}' ended but the model is not installed",
            model
        )),
    }
}

/// Cancel by model, or by the job id we started if no poll has listed it.
async fn cancel(coordinator: &Bunny, model: &str, job_id: &str) -> miette::Result<()> {
    match coordinator.cancel_download(model).await {
        Ok(()) => Ok(()),
        Err(DownloadError::NoActiveJob(_)) => coordinator
            .client()
            .cancel_pull(job_id)
            .await
            .and_then(|ack| ack.into_result())
            .map(|_| ())
            .map_err(|e| miette::miette!("Failed to cancel download: {}", e)),
        Err(e) => Err(miette::miette!("Failed to cancel download: {}", e)),
    }
}

fn rate(job: &DownloadJob) -> String {
    match progress(job, unix_now()) {
        Some(p) => {
            let eta = p
                .eta
                .map(|eta| format!("{}s", eta.as_secs()))
                .unwrap_or_else(|| "--".to_string());
            format!(
                "{:.0}% {}/s eta {}",
                p.percent,
                format_bytes(p.throughput_bps as u64),
                eta
            )
        }
        None => String::new(),
    }
}
