use crate::jobs::lock_key;
use crate::store::{KvStore, StoreError};
use crate::Fingerprint;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A held per-fingerprint render lock.
///
/// The stored value is the holder's job id and release is a
/// compare-and-delete on it, so a holder whose lock already expired cannot
/// remove a lock since re-acquired by another worker. The TTL bounds how long
/// a crashed holder blocks the fingerprint.
///
/// Call [`RenderLock::release`] on every exit path. A lock dropped without
/// release (panic, cancelled future) is released from a spawned task when a
/// Tokio runtime is available, and otherwise left to expire.
pub struct RenderLock {
    store: Arc<dyn KvStore>,
    key: String,
    holder: String,
    released: bool,
}

impl RenderLock {
    pub async fn acquire(
        store: Arc<dyn KvStore>,
        fingerprint: &Fingerprint,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<Option<RenderLock>, StoreError> {
        let key = lock_key(fingerprint);
        let holder = holder.to_string();
        if !store.set_if_absent(&key, &holder, ttl).await? {
            debug!(message = "Render lock busy", fingerprint = %fingerprint);
            return Ok(None);
        }
        debug!(message = "Render lock acquired", fingerprint = %fingerprint, holder = %holder);
        Ok(Some(RenderLock {
            store,
            key,
            holder,
            released: false,
        }))
    }

    /// Returns false when the lock had already expired or changed hands.
    pub async fn release(mut self) -> Result<bool, StoreError> {
        self.released = true;
        let released = self.store.compare_and_delete(&self.key, &self.holder).await?;
        if !released {
            warn!(message = "Render lock was no longer ours on release", key = %self.key);
        }
        Ok(released)
    }
}

impl Drop for RenderLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        runtime.spawn(async move {
            if let Err(err) = store.compare_and_delete(&key, &holder).await {
                warn!(message = "Failed to release dropped render lock", key = %key, error = %err);
            }
        });
    }
}
