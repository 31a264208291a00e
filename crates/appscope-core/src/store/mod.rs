//! Persisted task state.
//!
//! `KvStore` is the narrow string/TTL contract a backend has to honour; every
//! operation is atomic for a single key. `TaskStore` layers key namespacing
//! and JSON encoding for task records and the package dedup index on top.

mod memory;
mod redis_kv;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::model::TaskRecord;

pub use self::memory::MemoryKv;
pub use self::redis_kv::RedisKv;

pub const TASK_PREFIX: &str = "task:";
pub const INDEX_PREFIX: &str = "pkgindex:";

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
    /// Sets only when `key` is absent. Returns whether the write happened.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;
    /// Overwrites an existing key without touching its deadline. Returns
    /// `false` when the key is absent (or already expired).
    async fn set_keep_ttl(&self, key: &str, value: &str) -> StoreResult<bool>;
    async fn delete(&self, key: &str) -> StoreResult<bool>;
    /// Deletes `key` only while it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool>;
    /// Full keys (prefix included) of every live entry under `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
    async fn ping(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}

/// Opens the backend named by `url`: `memory` (or empty) for the in-process
/// map, `redis://` / `rediss://` for Redis.
pub fn open(url: &str, password: Option<&str>) -> StoreResult<Arc<dyn KvStore>> {
    let url = url.trim();
    if url.is_empty() || url.eq_ignore_ascii_case("memory") {
        info!("task store: in-process memory backend");
        return Ok(Arc::new(MemoryKv::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let url = with_password(url, password);
        info!("task store: redis at {}", redact_url(&url));
        return Ok(Arc::new(RedisKv::open(&url)?));
    }
    Err(StoreError::Unavailable(format!(
        "unsupported store url: {}",
        redact_url(url)
    )))
}

/// Injects `password` into a URL that carries no credentials of its own.
pub fn with_password(url: &str, password: Option<&str>) -> String {
    let Some(password) = password.filter(|p| !p.is_empty()) else {
        return url.to_string();
    };
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.contains('@') {
        return url.to_string();
    }
    format!("{scheme}://:{password}@{rest}")
}

pub fn redact_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if url[..colon_pos].contains("//") {
                let prefix = &url[..=colon_pos];
                let suffix = &url[at_pos..];
                return format!("{prefix}***{suffix}");
            }
        }
    }
    url.to_string()
}

#[derive(Clone)]
pub struct TaskStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl TaskStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn backend_name(&self) -> &'static str {
        self.kv.backend_name()
    }

    pub async fn put(&self, record: &TaskRecord) -> StoreResult<()> {
        let key = task_key(&record.task_id);
        let value = encode(&key, record)?;
        self.kv.set_ex(&key, &value, self.ttl).await
    }

    /// Rewrites an existing record, keeping its current deadline.
    pub async fn put_keep_ttl(&self, record: &TaskRecord) -> StoreResult<bool> {
        let key = task_key(&record.task_id);
        let value = encode(&key, record)?;
        self.kv.set_keep_ttl(&key, &value).await
    }

    pub async fn get(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        let key = task_key(task_id);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| StoreError::Codec {
                    key,
                    reason: err.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, task_id: &str) -> StoreResult<bool> {
        self.kv.delete(&task_key(task_id)).await
    }

    pub async fn put_index(&self, package: &str, task_id: &str) -> StoreResult<()> {
        self.kv.set_ex(&index_key(package), task_id, self.ttl).await
    }

    /// Points the package at `task_id` unless another live task holds it.
    pub async fn claim_index(&self, package: &str, task_id: &str) -> StoreResult<bool> {
        self.kv.set_nx_ex(&index_key(package), task_id, self.ttl).await
    }

    pub async fn get_index(&self, package: &str) -> StoreResult<Option<String>> {
        self.kv.get(&index_key(package)).await
    }

    /// Drops the index entry only while it still points at `task_id`.
    pub async fn delete_index_if(&self, package: &str, task_id: &str) -> StoreResult<bool> {
        self.kv.delete_if_eq(&index_key(package), task_id).await
    }

    /// Ids (prefix stripped) of every live key under `prefix`.
    pub async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let keys = self.kv.scan_prefix(prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(prefix).map(str::to_string))
            .collect())
    }

    pub async fn list_task_ids(&self) -> StoreResult<Vec<String>> {
        self.list_keys(TASK_PREFIX).await
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.kv.ping().await
    }
}

fn task_key(task_id: &str) -> String {
    format!("{TASK_PREFIX}{task_id}")
}

fn index_key(package: &str) -> String {
    format!("{INDEX_PREFIX}{package}")
}

fn encode(key: &str, record: &TaskRecord) -> StoreResult<String> {
    serde_json::to_string(record).map_err(|err| StoreError::Codec {
        key: key.to_string(),
        reason: err.to_string(),
    })
}
