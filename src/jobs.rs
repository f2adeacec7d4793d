use crate::store::{KvStore, StoreError};
use crate::{Fingerprint, JobRecord, RenderRequest, TransitionError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const QUEUE_KEY: &str = "poster:queue";
const JOB_KEY_PREFIX: &str = "poster:job:";
const ASSET_KEY_PREFIX: &str = "poster:asset:";
const ACTIVE_JOB_KEY_PREFIX: &str = "poster:active:";
const RENDER_LOCK_KEY_PREFIX: &str = "poster:lock:";

/// Attempts at a job record compare-and-swap before reporting a conflict.
const UPDATE_ATTEMPTS: usize = 5;

pub(crate) fn job_key(job_id: Uuid) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

pub(crate) fn asset_key(fingerprint: &Fingerprint) -> String {
    format!("{ASSET_KEY_PREFIX}{fingerprint}")
}

pub(crate) fn active_key(fingerprint: &Fingerprint) -> String {
    format!("{ACTIVE_JOB_KEY_PREFIX}{fingerprint}")
}

pub(crate) fn lock_key(fingerprint: &Fingerprint) -> String {
    format!("{RENDER_LOCK_KEY_PREFIX}{fingerprint}")
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Typed access to job records, the asset cache, the active-job index and
/// the work queue. Holds no state of its own: every call goes to the store.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn KvStore>,
}

impl JobStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        JobStore { store }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn decode(key: &str, raw: &str) -> Result<JobRecord, StoreError> {
        serde_json::from_str(raw).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })
    }

    fn encode(key: &str, job: &JobRecord) -> Result<String, StoreError> {
        serde_json::to_string(job).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let key = job_key(job_id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(Self::decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    pub async fn save_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let key = job_key(job.job_id);
        self.store.set(&key, &Self::encode(&key, job)?, None).await
    }

    /// Writes a fresh queued record. It is not live work until
    /// [`register_active`](Self::register_active) succeeds for it.
    pub async fn create_job(&self, request: &RenderRequest, fingerprint: Fingerprint) -> Result<JobRecord, StoreError> {
        let job = JobRecord::new(request, fingerprint);
        self.save_job(&job).await?;
        debug!(message = "Created job", job_id = %job.job_id, fingerprint = %job.fingerprint);
        Ok(job)
    }

    /// Deletes a record nobody else has seen, provided it is unchanged.
    pub async fn discard_job(&self, job: &JobRecord) -> Result<bool, StoreError> {
        let key = job_key(job.job_id);
        self.store
            .compare_and_delete(&key, &Self::encode(&key, job)?)
            .await
    }

    /// Read-modify-write of one record, retried on concurrent modification.
    pub async fn update_job<F>(&self, job_id: Uuid, apply: F) -> Result<JobRecord, UpdateError>
    where
        F: Fn(&mut JobRecord) -> Result<(), TransitionError>,
    {
        let key = job_key(job_id);
        for _ in 0..UPDATE_ATTEMPTS {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or(UpdateError::NotFound(job_id))?;
            let mut job = Self::decode(&key, &raw)?;
            apply(&mut job)?;
            let updated = Self::encode(&key, &job)?;
            if self.store.compare_and_swap(&key, &raw, &updated).await? {
                return Ok(job);
            }
            debug!(message = "Job record changed underneath, retrying", job_id = %job_id);
        }
        Err(StoreError::Conflict(key).into())
    }

    pub async fn mark_running(&self, job_id: Uuid) -> Result<JobRecord, UpdateError> {
        self.update_job(job_id, |job| job.start()).await
    }

    pub async fn mark_completed(&self, job_id: Uuid, asset_url: &str) -> Result<JobRecord, UpdateError> {
        self.update_job(job_id, |job| job.complete(asset_url)).await
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<JobRecord, UpdateError> {
        self.update_job(job_id, |job| job.fail(error)).await
    }

    pub async fn enqueue(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.store.push(QUEUE_KEY, &job_id.to_string()).await
    }

    pub async fn pop_job(&self, timeout: Duration) -> Result<Option<Uuid>, StoreError> {
        let Some(item) = self.store.pop(QUEUE_KEY, timeout).await? else {
            return Ok(None);
        };
        match Uuid::parse_str(&item) {
            Ok(job_id) => Ok(Some(job_id)),
            Err(err) => {
                warn!(message = "Dropping malformed queue item", item = %item, error = %err);
                Ok(None)
            }
        }
    }

    pub async fn cached_asset(&self, fingerprint: &Fingerprint) -> Result<Option<String>, StoreError> {
        self.store.get(&asset_key(fingerprint)).await
    }

    pub async fn set_cached_asset(&self, fingerprint: &Fingerprint, asset_url: &str) -> Result<(), StoreError> {
        self.store.set(&asset_key(fingerprint), asset_url, None).await
    }

    pub async fn active_job_id(&self, fingerprint: &Fingerprint) -> Result<Option<Uuid>, StoreError> {
        let key = active_key(fingerprint);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match Uuid::parse_str(&raw) {
            Ok(job_id) => Ok(Some(job_id)),
            Err(err) => {
                // Left in place it would block registration until its TTL.
                warn!(message = "Dropping malformed active entry", key = %key, error = %err);
                self.store.compare_and_delete(&key, &raw).await?;
                Ok(None)
            }
        }
    }

    /// Makes `job_id` the fingerprint's active job unless one is registered.
    pub async fn register_active(
        &self,
        fingerprint: &Fingerprint,
        job_id: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(&active_key(fingerprint), &job_id.to_string(), ttl)
            .await
    }

    /// Clears the active entry only if it still points at `job_id`.
    pub async fn clear_active_job(&self, fingerprint: &Fingerprint, job_id: Uuid) -> Result<bool, StoreError> {
        self.store
            .compare_and_delete(&active_key(fingerprint), &job_id.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::{JobKind, JobStatus};

    fn jobs() -> JobStore {
        JobStore::new(Arc::new(MemoryStore::new()))
    }

    fn request() -> RenderRequest {
        RenderRequest::new("Paris", "France", "noir", JobKind::Poster)
    }

    #[tokio::test]
    async fn create_writes_record_without_active_entry() {
        let jobs = jobs();
        let fp = Fingerprint::from_hex("f1");
        let job = jobs.create_job(&request(), fp.clone()).await.unwrap();
        assert_eq!(jobs.get_job(job.job_id).await.unwrap(), Some(job.clone()));
        assert_eq!(jobs.active_job_id(&fp).await.unwrap(), None);
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let jobs = jobs();
        let fp = Fingerprint::from_hex("f2");
        let ttl = Duration::from_secs(60);
        let first = jobs.create_job(&request(), fp.clone()).await.unwrap();
        let second = jobs.create_job(&request(), fp.clone()).await.unwrap();

        assert!(jobs.register_active(&fp, first.job_id, ttl).await.unwrap());
        assert!(!jobs.register_active(&fp, second.job_id, ttl).await.unwrap());
        assert_eq!(jobs.active_job_id(&fp).await.unwrap(), Some(first.job_id));
    }

    #[tokio::test]
    async fn clear_active_job_is_compare_and_delete() {
        let jobs = jobs();
        let fp = Fingerprint::from_hex("f2");
        let ttl = Duration::from_secs(60);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(jobs.register_active(&fp, second, ttl).await.unwrap());

        assert!(!jobs.clear_active_job(&fp, first).await.unwrap());
        assert_eq!(jobs.active_job_id(&fp).await.unwrap(), Some(second));
        assert!(jobs.clear_active_job(&fp, second).await.unwrap());
        assert_eq!(jobs.active_job_id(&fp).await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_active_entry_is_dropped() {
        let jobs = jobs();
        let fp = Fingerprint::from_hex("f4");
        jobs.kv().set(&active_key(&fp), "garbage", None).await.unwrap();
        assert_eq!(jobs.active_job_id(&fp).await.unwrap(), None);
        assert!(jobs.register_active(&fp, Uuid::new_v4(), Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn discard_only_removes_unchanged_record() {
        let jobs = jobs();
        let job = jobs.create_job(&request(), Fingerprint::from_hex("f5")).await.unwrap();
        jobs.mark_running(job.job_id).await.unwrap();
        assert!(!jobs.discard_job(&job).await.unwrap());
        assert!(jobs.get_job(job.job_id).await.unwrap().is_some());

        let fresh = jobs.create_job(&request(), Fingerprint::from_hex("f5")).await.unwrap();
        assert!(jobs.discard_job(&fresh).await.unwrap());
        assert_eq!(jobs.get_job(fresh.job_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn updates_enforce_lifecycle() {
        let jobs = jobs();
        let job = jobs.create_job(&request(), Fingerprint::from_hex("f3")).await.unwrap();

        let err = jobs.mark_completed(job.job_id, "/a.png").await.unwrap_err();
        assert!(matches!(err, UpdateError::Transition(_)));

        jobs.mark_running(job.job_id).await.unwrap();
        let done = jobs.mark_completed(job.job_id, "/a.png").await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let stored = jobs.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.asset_url.as_deref(), Some("/a.png"));
        assert!(jobs.mark_failed(job.job_id, "late").await.is_err());
    }

    #[tokio::test]
    async fn updating_unknown_job_is_not_found() {
        let err = jobs().mark_running(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, UpdateError::NotFound(_)));
    }

    #[tokio::test]
    async fn queue_round_trips_job_ids_and_skips_garbage() {
        let jobs = jobs();
        jobs.kv().push(QUEUE_KEY, "not-a-uuid").await.unwrap();
        let id = Uuid::new_v4();
        jobs.enqueue(id).await.unwrap();
        let wait = Duration::from_millis(10);
        assert_eq!(jobs.pop_job(wait).await.unwrap(), None);
        assert_eq!(jobs.pop_job(wait).await.unwrap(), Some(id));
    }
}
