use std::time::Duration;

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::debug;

use super::KvStore;
use crate::error::{StoreError, StoreResult};

const SCAN_BATCH: u64 = 100;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis backend over a lazily established `ConnectionManager`, so the
/// service starts (degraded) while Redis is down and recovers on its own.
pub struct RedisKv {
    client: ::redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisKv {
    pub fn open(url: &str) -> StoreResult<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn conn(&self) -> StoreResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|e| unavailable("connect", e))?;
        Ok(conn.clone())
    }
}

fn unavailable(op: &str, err: ::redis::RedisError) -> StoreError {
    StoreError::Unavailable(format!("redis {op} failed: {err}"))
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("GET", e))?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("SET EX", e))?;
        debug!(key, ttl_secs = ttl_secs(ttl), "redis SET EX");
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn set_keep_ttl(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("SET XX KEEPTTL", e))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = ::redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("DEL", e))?;
        Ok(removed > 0)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = ::redis::cmd("EVAL")
            .arg(COMPARE_AND_DELETE)
            .arg(1)
            .arg(key)
            .arg(expected)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("EVAL compare-and-delete", e))?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable("SCAN", e))?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("PING", e))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {pong}")))
        }
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
