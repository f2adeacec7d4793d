//! Single-process `KvStore` for tests and local runs. Nothing is shared
//! between processes, so only worker loops inside one process coordinate.

use crate::store::{KvStore, StoreError};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{timeout, Instant};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Queue = (Sender<String>, Receiver<String>);

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    queues: Mutex<HashMap<String, Queue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks the entries and drops everything expired, so keys that are
    /// written once and never read again do not accumulate.
    fn swept_entries(&self, now: Instant) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.entries();
        entries.retain(|_, entry| entry.is_live(now));
        entries
    }

    fn queue(&self, name: &str) -> Queue {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(name.to_string())
            .or_insert_with(async_channel::unbounded)
            .clone()
    }

    /// Number of stored keys, expired ones included until the next write.
    pub fn key_count(&self) -> usize {
        self.entries().len()
    }

    /// Number of items waiting in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queue(queue).1.len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        self.swept_entries(now).insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.swept_entries(now);
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        let matches = entries
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entry.value = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn push(&self, queue: &str, item: &str) -> Result<(), StoreError> {
        let (sender, _) = self.queue(queue);
        sender
            .send(item.to_string())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<String>, StoreError> {
        let (_, receiver) = self.queue(queue);
        match timeout(wait, receiver.recv()).await {
            Ok(Ok(item)) => Ok(Some(item)),
            Ok(Err(err)) => Err(StoreError::Unavailable(err.to_string())),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
