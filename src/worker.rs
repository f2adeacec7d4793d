use crate::config::WorkerSettings;
use crate::jobs::{JobStore, UpdateError};
use crate::lock::RenderLock;
use crate::render::{Publisher, Renderer};
use crate::{Fingerprint, JobRecord};
use anyhow::{anyhow, Error};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// Pause after the store fails a queue pop, so an outage is not a busy loop.
const POP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum WorkMessage {
    JobCompleted(Uuid, String),
    JobFailed(Uuid, String),
    JobSkipped(Uuid),
}

/// How processing one popped job id ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(String),
    Failed(String),
    /// Record missing or no longer queued; nothing was changed.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for the in-flight render of {fingerprint} after {waited:?}")]
pub struct LockWaitTimeout {
    pub fingerprint: Fingerprint,
    pub waited: Duration,
}

/// One sequential consumer of the work queue. Any number of these may run,
/// in one process or many, against the same store.
#[derive(Clone)]
pub struct Worker {
    jobs: JobStore,
    renderer: Arc<dyn Renderer>,
    publisher: Arc<dyn Publisher>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        jobs: JobStore,
        renderer: Arc<dyn Renderer>,
        publisher: Arc<dyn Publisher>,
        settings: WorkerSettings,
    ) -> Self {
        Worker {
            jobs,
            renderer,
            publisher,
            settings,
        }
    }

    /// Pops and processes jobs until `cancel_token` fires. The token is
    /// checked between pops; a job in progress always runs to a terminal state.
    pub async fn start(self, cancel_token: CancellationToken, send_to_server: UnboundedSender<WorkMessage>) {
        while !cancel_token.is_cancelled() {
            let job_id = match self.jobs.pop_job(self.settings.poll_timeout).await {
                Ok(Some(job_id)) => job_id,
                Ok(None) => continue,
                Err(err) => {
                    error!(message = "Error popping job from queue", error = %err);
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = sleep(POP_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let message = match self.process_job(job_id).await {
                Outcome::Completed(asset_url) => WorkMessage::JobCompleted(job_id, asset_url),
                Outcome::Failed(error) => WorkMessage::JobFailed(job_id, error),
                Outcome::Skipped => WorkMessage::JobSkipped(job_id),
            };
            if send_to_server.send(message).is_err() {
                debug!("Server channel closed, outcome not reported");
            }
        }
        info!("Worker stopped.");
    }

    /// Drives one job to a terminal state. Never panics or returns an error:
    /// every failure ends up on the job record.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn process_job(&self, job_id: Uuid) -> Outcome {
        let job = match self.jobs.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("Popped job has no record, dropping");
                return Outcome::Skipped;
            }
            Err(err) => {
                error!(message = "Could not load job", error = %err);
                return self.fail(job_id, None, &err.to_string()).await;
            }
        };

        let job = match self.jobs.mark_running(job_id).await {
            Ok(job) => job,
            Err(UpdateError::NotFound(_)) => return Outcome::Skipped,
            Err(UpdateError::Transition(err)) => {
                warn!(message = "Popped job is not queued, dropping", error = %err);
                return Outcome::Skipped;
            }
            Err(UpdateError::Store(err)) => {
                error!(message = "Could not start job", error = %err);
                return self.fail(job_id, Some(&job.fingerprint), &err.to_string()).await;
            }
        };

        match self.run(&job).await {
            Ok(asset_url) => {
                info!(message = "Job completed", asset_url = %asset_url);
                Outcome::Completed(asset_url)
            }
            Err(err) => self.fail(job_id, Some(&job.fingerprint), &err.to_string()).await,
        }
    }

    async fn run(&self, job: &JobRecord) -> Result<String, Error> {
        // The coordinator checked too, but the cache may have filled since.
        if let Some(asset_url) = self.jobs.cached_asset(&job.fingerprint).await? {
            debug!("Asset cached since submission, skipping render");
            self.finish(job, &asset_url).await?;
            return Ok(asset_url);
        }

        let lock = RenderLock::acquire(
            self.jobs.kv().clone(),
            &job.fingerprint,
            job.job_id,
            self.settings.lock_ttl,
        )
        .await?;

        match lock {
            Some(lock) => {
                let result = self.render_and_publish(job).await;
                if let Err(err) = lock.release().await {
                    warn!(message = "Failed to release render lock", error = %err);
                }
                result
            }
            None => self.wait_for_asset(job).await,
        }
    }

    async fn render_and_publish(&self, job: &JobRecord) -> Result<String, Error> {
        // A previous holder may have published between our cache check and
        // the lock acquisition.
        if let Some(asset_url) = self.jobs.cached_asset(&job.fingerprint).await? {
            self.finish(job, &asset_url).await?;
            return Ok(asset_url);
        }

        let output = self
            .settings
            .work_dir
            .join(format!("{}.png", job.fingerprint));
        let renderer = self.renderer.clone();
        let publisher = self.publisher.clone();
        let request = job.request();
        let fingerprint = job.fingerprint.clone();
        let scratch = output.clone();

        // Own task, so a panicking collaborator surfaces as a JoinError.
        let task = tokio::spawn(async move {
            renderer.render(&request, &scratch).await?;
            publisher.publish(&fingerprint, &scratch).await
        });
        let joined = task.await;
        remove_scratch(&output).await;
        let asset_url = match joined {
            Ok(result) => result?,
            Err(err) => return Err(anyhow!("render task aborted: {err}")),
        };

        // Best effort: a missed cache write only costs a redundant render later.
        if let Err(err) = self.jobs.set_cached_asset(&job.fingerprint, &asset_url).await {
            warn!(message = "Failed to cache asset", error = %err);
        }
        self.finish(job, &asset_url).await?;
        Ok(asset_url)
    }

    /// Another worker holds the lock: poll the cache instead of rendering.
    async fn wait_for_asset(&self, job: &JobRecord) -> Result<String, Error> {
        debug!(
            message = "Render lock busy, waiting for asset",
            retries = self.settings.lock_wait_retries
        );
        for _ in 0..self.settings.lock_wait_retries {
            sleep(self.settings.lock_wait_interval).await;
            if let Some(asset_url) = self.jobs.cached_asset(&job.fingerprint).await? {
                self.finish(job, &asset_url).await?;
                return Ok(asset_url);
            }
        }
        Err(LockWaitTimeout {
            fingerprint: job.fingerprint.clone(),
            waited: self.settings.lock_wait_interval * self.settings.lock_wait_retries,
        }
        .into())
    }

    async fn finish(&self, job: &JobRecord, asset_url: &str) -> Result<(), Error> {
        self.jobs.mark_completed(job.job_id, asset_url).await?;
        self.clear_active(&job.fingerprint, job.job_id).await;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, fingerprint: Option<&Fingerprint>, error: &str) -> Outcome {
        warn!(message = "Job failed", error = %error);
        if let Err(err) = self.jobs.mark_failed(job_id, error).await {
            error!(message = "Could not record job failure", error = %err);
        }
        if let Some(fingerprint) = fingerprint {
            self.clear_active(fingerprint, job_id).await;
        }
        Outcome::Failed(error.to_string())
    }

    async fn clear_active(&self, fingerprint: &Fingerprint, job_id: Uuid) {
        if let Err(err) = self.jobs.clear_active_job(fingerprint, job_id).await {
            warn!(message = "Failed to clear active job", error = %err);
        }
    }
}

/// The renderer may leave a partial file behind on failure.
async fn remove_scratch(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => debug!(message = "Could not remove scratch file", error = %err),
    }
}
