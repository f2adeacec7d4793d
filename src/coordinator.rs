use crate::fingerprint::fingerprint;
use crate::jobs::JobStore;
use crate::store::StoreError;
use crate::{Fingerprint, JobRecord, JobStatus, PipelineVersion, RenderRequest};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What a submitter gets back; poll [`Coordinator::get_job`] for progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub fingerprint: Fingerprint,
    pub asset_url: Option<String>,
    pub preview_url: Option<String>,
    pub error: Option<String>,
}

impl From<&JobRecord> for JobHandle {
    fn from(job: &JobRecord) -> Self {
        JobHandle {
            job_id: job.job_id,
            status: job.status,
            fingerprint: job.fingerprint.clone(),
            asset_url: job.asset_url.clone(),
            preview_url: job.preview_url.clone(),
            error: job.error.clone(),
        }
    }
}

/// Registration rounds lost to concurrent submitters before giving up.
const REGISTER_ATTEMPTS: usize = 5;

/// API-side entry point. Never waits for a render.
#[derive(Clone)]
pub struct Coordinator {
    jobs: JobStore,
    version: PipelineVersion,
    active_ttl: Duration,
}

impl Coordinator {
    pub fn new(jobs: JobStore, version: PipelineVersion, active_ttl: Duration) -> Self {
        Coordinator {
            jobs,
            version,
            active_ttl,
        }
    }

    pub fn fingerprint(&self, request: &RenderRequest) -> Fingerprint {
        fingerprint(request, &self.version)
    }

    /// Cache hit, then attach to an in-flight job, then enqueue new work.
    ///
    /// A new job only becomes live by winning a set-if-absent on the
    /// fingerprint's active entry, so concurrent submitters converge on one
    /// job. The queue push comes last; if it fails, the entry and record are
    /// withdrawn before the error is returned.
    #[instrument(skip_all, fields(fingerprint = tracing::field::Empty))]
    pub async fn submit(&self, request: &RenderRequest) -> Result<JobHandle, StoreError> {
        let fingerprint = self.fingerprint(request);
        tracing::Span::current().record("fingerprint", fingerprint.as_str());

        if let Some(asset_url) = self.jobs.cached_asset(&fingerprint).await? {
            let mut job = JobRecord::new(request, fingerprint);
            job.start()
                .and_then(|_| job.complete(&asset_url))
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            self.jobs.save_job(&job).await?;
            info!(message = "Cache hit", job_id = %job.job_id);
            return Ok(JobHandle::from(&job));
        }

        let mut pending: Option<JobRecord> = None;
        for _ in 0..REGISTER_ATTEMPTS {
            if let Some(active) = self.live_active_job(&fingerprint).await? {
                if let Some(job) = pending.take() {
                    self.withdraw(&job).await;
                }
                debug!(message = "Attached to in-flight job", job_id = %active.job_id);
                return Ok(JobHandle::from(&active));
            }

            let job = match pending.take() {
                Some(job) => job,
                None => self.jobs.create_job(request, fingerprint.clone()).await?,
            };
            match self
                .jobs
                .register_active(&fingerprint, job.job_id, self.active_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(message = "Lost active-job registration, rechecking", job_id = %job.job_id);
                    pending = Some(job);
                    continue;
                }
                Err(err) => {
                    self.withdraw(&job).await;
                    return Err(err);
                }
            }

            if let Err(err) = self.jobs.enqueue(job.job_id).await {
                error!(message = "Could not enqueue job", job_id = %job.job_id, error = %err);
                self.withdraw(&job).await;
                return Err(err);
            }
            info!(message = "Queued job", job_id = %job.job_id);
            return Ok(JobHandle::from(&job));
        }

        if let Some(job) = pending {
            self.withdraw(&job).await;
        }
        Err(StoreError::Conflict(format!(
            "active job registration for {fingerprint}"
        )))
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        self.jobs.get_job(job_id).await
    }

    /// The registered job for `fingerprint`, if it can still produce an asset.
    /// Entries whose record is gone or finished are cleared.
    async fn live_active_job(&self, fingerprint: &Fingerprint) -> Result<Option<JobRecord>, StoreError> {
        let Some(active_id) = self.jobs.active_job_id(fingerprint).await? else {
            return Ok(None);
        };
        match self.jobs.get_job(active_id).await? {
            Some(job) if !job.status.is_terminal() => Ok(Some(job)),
            stale => {
                debug!(
                    message = "Clearing stale active entry",
                    job_id = %active_id,
                    status = ?stale.map(|job| job.status)
                );
                self.jobs.clear_active_job(fingerprint, active_id).await?;
                Ok(None)
            }
        }
    }

    /// Best-effort removal of a job that never became live work.
    async fn withdraw(&self, job: &JobRecord) {
        if let Err(err) = self.jobs.clear_active_job(&job.fingerprint, job.job_id).await {
            warn!(message = "Failed to clear active entry", job_id = %job.job_id, error = %err);
        }
        if let Err(err) = self.jobs.discard_job(job).await {
            warn!(message = "Failed to discard job record", job_id = %job.job_id, error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::jobs::QUEUE_KEY;
    use crate::JobKind;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryStore>, Coordinator) {
        let store = Arc::new(MemoryStore::new());
        let jobs = JobStore::new(store.clone());
        let coordinator = Coordinator::new(jobs, PipelineVersion::default(), Duration::from_secs(3600));
        (store, coordinator)
    }

    fn paris() -> RenderRequest {
        RenderRequest::new("Paris", "France", "noir", JobKind::Poster)
    }

    #[tokio::test]
    async fn new_request_is_queued_once() {
        let (store, coordinator) = setup();
        let handle = coordinator.submit(&paris()).await.unwrap();
        assert_eq!(handle.status, JobStatus::Queued);
        assert_eq!(store.queue_len(QUEUE_KEY), 1);
        let record = coordinator.get_job(handle.job_id).await.unwrap().unwrap();
        assert_eq!(record.fingerprint, handle.fingerprint);
    }

    #[tokio::test]
    async fn identical_request_attaches_to_in_flight_job() {
        let (store, coordinator) = setup();
        let first = coordinator.submit(&paris()).await.unwrap();
        let mut again = paris();
        again.kind = JobKind::Preview;
        again.theme = " Noir ".into();
        let second = coordinator.submit(&again).await.unwrap();
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(store.queue_len(QUEUE_KEY), 1);
    }

    #[tokio::test]
    async fn cached_asset_short_circuits() {
        let (store, coordinator) = setup();
        let fp = coordinator.fingerprint(&paris());
        coordinator.jobs.set_cached_asset(&fp, "/v1/assets/p.png").await.unwrap();

        let handle = coordinator.submit(&paris()).await.unwrap();
        assert_eq!(handle.status, JobStatus::Completed);
        assert_eq!(handle.asset_url.as_deref(), Some("/v1/assets/p.png"));
        assert_eq!(store.queue_len(QUEUE_KEY), 0);
        assert_eq!(coordinator.jobs.active_job_id(&fp).await.unwrap(), None);

        let record = coordinator.get_job(handle.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stale_active_entry_without_record_creates_new_job() {
        let (store, coordinator) = setup();
        let fp = coordinator.fingerprint(&paris());
        let ghost = Uuid::new_v4();
        coordinator
            .jobs
            .kv()
            .set(&crate::jobs::active_key(&fp), &ghost.to_string(), None)
            .await
            .unwrap();

        let handle = coordinator.submit(&paris()).await.unwrap();
        assert_ne!(handle.job_id, ghost);
        assert_eq!(store.queue_len(QUEUE_KEY), 1);
    }

    #[tokio::test]
    async fn cache_hit_keeps_in_flight_active_entry() {
        let (store, coordinator) = setup();
        let fp = coordinator.fingerprint(&paris());
        let in_flight = coordinator.submit(&paris()).await.unwrap();
        coordinator.jobs.set_cached_asset(&fp, "/v1/assets/p.png").await.unwrap();

        let hit = coordinator.submit(&paris()).await.unwrap();
        assert_eq!(hit.status, JobStatus::Completed);
        assert_ne!(hit.job_id, in_flight.job_id);
        assert_eq!(
            coordinator.jobs.active_job_id(&fp).await.unwrap(),
            Some(in_flight.job_id)
        );
        assert_eq!(store.queue_len(QUEUE_KEY), 1);
    }

    #[tokio::test]
    async fn finished_active_job_is_not_attached() {
        let (store, coordinator) = setup();
        let fp = coordinator.fingerprint(&paris());
        let failed = coordinator.submit(&paris()).await.unwrap();
        coordinator.jobs.mark_running(failed.job_id).await.unwrap();
        coordinator.jobs.mark_failed(failed.job_id, "boom").await.unwrap();

        let handle = coordinator.submit(&paris()).await.unwrap();
        assert_ne!(handle.job_id, failed.job_id);
        assert_eq!(handle.status, JobStatus::Queued);
        assert_eq!(coordinator.jobs.active_job_id(&fp).await.unwrap(), Some(handle.job_id));
        assert_eq!(store.queue_len(QUEUE_KEY), 2);
    }

    #[tokio::test]
    async fn unknown_job_is_absent() {
        let (_, coordinator) = setup();
        assert!(coordinator.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }
}
