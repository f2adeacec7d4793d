use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached or rejected the operation.
    /// Callers should surface this as a retryable failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record under {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("concurrent update of {0}, giving up")]
    Conflict(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Key-value store shared by every coordinator and worker instance.
///
/// All coordination (dedup, locking) is expressed with the conditional
/// primitives here, each of which must be a single atomic operation in the
/// backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write; `ttl` of `None` means the key never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Writes only when the key is absent or expired. Returns whether it wrote.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Deletes the key only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Replaces the value only while it still holds `expected`, keeping any expiry.
    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> Result<bool, StoreError>;

    /// Appends to the tail of a FIFO queue.
    async fn push(&self, queue: &str, item: &str) -> Result<(), StoreError>;

    /// Takes the head of a FIFO queue, waiting up to `timeout` for one to arrive.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
