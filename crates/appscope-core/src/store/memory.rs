use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::KvStore;
use crate::error::StoreResult;

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process backend. Deadlines use the tokio clock so paused-time tests
/// can step past a TTL; expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        entries
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.live().get(key).map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.live().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.live();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn set_keep_ttl(&self, key: &str, value: &str) -> StoreResult<bool> {
        match self.live().get_mut(key) {
            Some(entry) => {
                entry.value = value.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.live().remove(key).is_some())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut entries = self.live();
        if entries.get(key).is_some_and(|entry| entry.value == expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .live()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
