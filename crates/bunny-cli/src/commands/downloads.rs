//! Download job listing.

use bunny_coordinator::{progress, unix_now};

use super::{format_bytes, Bunny};

/// Show active downloads, or retry one job.
pub(crate) async fn run(coordinator: &Bunny, retry: Option<&str>) -> miette::Result<()> {
    coordinator
        .poll_downloads()
        .await
        .map_err(|e| miette::miette!("Failed to list downloads: {}", e))?;

    if let Some(job_id) = retry {
        let new_id = coordinator
            .retry_download(job_id)
            .await
            .map_err(|e| miette::miette!("Failed to retry download: {}", e))?;
        println!("Retrying as job {}.", new_id);
        println!("Follow it with:");
        println!("  bunny downloads");
        return Ok(());
    }

    let jobs = coordinator.downloads();
    if jobs.is_empty() {
        println!("No downloads.");
        return Ok(());
    }

    let now = unix_now();
    println!("Downloads:");
    for job in jobs {
        let status = format!("{:?}", job.status).to_lowercase();
        let done = format_bytes(job.downloaded);
        match (job.size, progress(&job, now)) {
            (Some(size), Some(p)) => println!(
                "  - {} [{}] {}: {}/{} ({:.0}%)",
                job.model,
                job.id,
                status,
                done,
                format_bytes(size),
                p.percent
            ),
            _ => println!("  - {} [{}] {}: {}", job.model, job.id, status, done),
        }
        if let Some(error) = &job.error {
            println!("      {}", error);
        }
    }
    Ok(())
}
