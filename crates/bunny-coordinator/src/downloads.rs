//! Model download tracking.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bunny_client::{ClientError, ControlPlane, DownloadJob, JobStatus, PullRequest};
use thiserror::Error;
use tracing::{debug, info};

use crate::lock;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("no active download for '{0}'")]
    NoActiveJob(String),

    #[error("control plane did not return a job id")]
    MissingJobId,
}

/// Metrics derived from a job's byte counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobProgress {
    /// 0 to 100.
    pub percent: f64,
    /// Bytes per second since the job started.
    pub throughput_bps: f64,
    /// Unknown until the first bytes arrive.
    pub eta: Option<Duration>,
}

/// Derive percent, throughput and ETA at `now` (Unix seconds).
///
/// Returns `None` when the size is unknown or zero, or when the start time is
/// missing or not in the past.
pub fn progress(job: &DownloadJob, now: f64) -> Option<JobProgress> {
    let size = job.size.filter(|&s| s > 0)? as f64;
    let started_at = job.started_at.filter(|s| s.is_finite())?;
    let elapsed = now - started_at;
    if elapsed.is_nan() || elapsed <= 0.0 {
        return None;
    }

    let downloaded = job.downloaded as f64;
    let percent = (downloaded / size * 100.0).clamp(0.0, 100.0);
    let throughput_bps = downloaded / elapsed;
    let remaining = (size - downloaded).max(0.0);
    let eta = if remaining == 0.0 {
        Some(Duration::ZERO)
    } else if throughput_bps > 0.0 {
        Duration::try_from_secs_f64(remaining / throughput_bps).ok()
    } else {
        None
    };

    Some(JobProgress {
        percent,
        throughput_bps,
        eta,
    })
}

/// Current Unix time in seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// What changed in one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Models that were downloading before this poll and no longer are.
    pub finished: Vec<String>,
}

/// Mirrors the control plane's active download jobs.
#[derive(Debug, Default)]
pub struct DownloadTracker {
    jobs: Mutex<HashMap<String, DownloadJob>>,
    downloading: Mutex<BTreeSet<String>>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs from the last poll, ordered by model name.
    pub fn jobs(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = lock(&self.jobs).values().cloned().collect();
        jobs.sort_by(|a, b| a.model.cmp(&b.model).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn downloading(&self) -> Vec<String> {
        lock(&self.downloading).iter().cloned().collect()
    }

    pub fn is_downloading(&self, model: &str) -> bool {
        lock(&self.downloading).contains(model)
    }

    /// Replace the tracked job set with the server's view.
    pub fn apply(&self, jobs: HashMap<String, DownloadJob>) -> PollReport {
        let active: BTreeSet<String> = jobs
            .values()
            .filter(|job| job.status.is_active())
            .map(|job| job.model.clone())
            .collect();

        let finished = {
            let mut downloading = lock(&self.downloading);
            let finished: Vec<String> = downloading.difference(&active).cloned().collect();
            *downloading = active;
            finished
        };
        *lock(&self.jobs) = jobs;

        if !finished.is_empty() {
            info!(models = ?finished, "downloads finished");
        }
        PollReport { finished }
    }

    /// Fetch `/downloads/active` and apply it.
    pub async fn poll<C: ControlPlane + ?Sized>(&self, client: &C) -> Result<PollReport, DownloadError> {
        let jobs = client.active_downloads().await?;
        debug!(jobs = jobs.len(), "polled downloads");
        Ok(self.apply(jobs))
    }

    /// Start pulling `model`. Returns the job id.
    ///
    /// The job is tracked as queued until the next poll reports it, so it can
    /// be cancelled right away.
    pub async fn start<C: ControlPlane + ?Sized>(
        &self,
        client: &C,
        model: &str,
    ) -> Result<String, DownloadError> {
        let ack = client
            .pull_model(&PullRequest {
                model: model.to_string(),
            })
            .await?
            .into_result()?;
        let job_id = ack.job_id.ok_or(DownloadError::MissingJobId)?;

        lock(&self.jobs).insert(
            job_id.clone(),
            DownloadJob {
                id: job_id.clone(),
                model: model.to_string(),
                status: JobStatus::Queued,
                downloaded: 0,
                size: None,
                error: None,
                started_at: None,
                finished_at: None,
            },
        );
        lock(&self.downloading).insert(model.to_string());
        info!(model, job_id = %job_id, "download started");
        Ok(job_id)
    }

    /// Cancel the queued or running job for `model`.
    pub async fn cancel<C: ControlPlane + ?Sized>(
        &self,
        client: &C,
        model: &str,
    ) -> Result<(), DownloadError> {
        let job_id = lock(&self.jobs)
            .values()
            .find(|job| job.model == model && job.status.is_active())
            .map(|job| job.id.clone())
            .ok_or_else(|| DownloadError::NoActiveJob(model.to_string()))?;

        client.cancel_pull(&job_id).await?.into_result()?;

        lock(&self.downloading).remove(model);
        lock(&self.jobs).remove(&job_id);
        info!(model, job_id = %job_id, "download cancelled");
        Ok(())
    }

    /// Retry a failed or cancelled job. Returns the new job id.
    pub async fn retry<C: ControlPlane + ?Sized>(
        &self,
        client: &C,
        job_id: &str,
    ) -> Result<String, DownloadError> {
        let ack = client.retry_pull(job_id).await?.into_result()?;
        let new_id = ack.job_id.ok_or(DownloadError::MissingJobId)?;

        let model = lock(&self.jobs).get(job_id).map(|job| job.model.clone());
        if let Some(model) = &model {
            lock(&self.downloading).insert(model.clone());
        }
        info!(job_id, new_job_id = %new_id, model = model.as_deref().unwrap_or("unknown"), "download retried");
        Ok(new_id)
    }
}
