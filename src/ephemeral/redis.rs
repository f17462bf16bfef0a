//! Redis-backed ephemeral store.
//!
//! Pooled connections via deadpool; every operation maps 1:1 onto a Redis
//! command (GET, SET EX, DEL, SCAN+MGET, RPUSH, LTRIM, LRANGE, EXPIRE), so
//! single-key atomicity comes straight from the server.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config, Pool, Runtime};

use super::{EphemeralError, EphemeralStore};

/// Redis ephemeral store over a deadpool pool.
pub struct RedisEphemeralStore {
    pool: Pool,
}

impl RedisEphemeralStore {
    /// Connect to `redis://…`. Fails fast if the URL cannot be parsed or a
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, EphemeralError> {
        let config = Config::from_url(url);
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| EphemeralError::Backend(e.to_string()))?;

        // Probe the connection so startup failures surface immediately.
        let mut conn = pool
            .get()
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))?;
        let _: String = deadpool_redis::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, EphemeralError> {
        self.pool
            .get()
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl EphemeralStore for RedisEphemeralStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EphemeralError> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), EphemeralError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl))
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, EphemeralError> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn
            .del(key)
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, EphemeralError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{prefix}*");
        // Cursor-based SCAN so large keyspaces never block the server.
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = deadpool_redis::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| EphemeralError::Backend(e.to_string()))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        // MGET returns nil for keys that expired between SCAN and here.
        let values: Vec<Option<String>> = conn
            .mget(&keys)
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))?;
        Ok(values.into_iter().flatten().collect())
    }

    async fn right_push(&self, key: &str, value: String) -> Result<u64, EphemeralError> {
        let mut conn = self.conn().await?;
        conn.rpush(key, value)
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))
    }

    async fn trim(&self, key: &str, start: i64, stop: i64) -> Result<(), EphemeralError> {
        let mut conn = self.conn().await?;
        conn.ltrim::<_, ()>(key, start as isize, stop as isize)
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, EphemeralError> {
        let mut conn = self.conn().await?;
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EphemeralError> {
        let mut conn = self.conn().await?;
        conn.expire(key, ttl_secs(ttl) as i64)
            .await
            .map_err(|e| EphemeralError::Backend(e.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
