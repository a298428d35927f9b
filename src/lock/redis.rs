//! Redis lock backend: `SET NX PX` to acquire, compare-and-delete to release.

use super::LockBackend;
use crate::backend::RedisConfig;
use crate::error::{Error, Result};
use deadpool_redis::redis::{cmd, Script};
use deadpool_redis::Pool;
use std::time::Duration;

/// Delete the key only while it still stores our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock leases stored as plain Redis keys holding the owner token.
#[derive(Clone)]
pub struct RedisLockBackend {
    pool: Pool,
}

impl RedisLockBackend {
    /// # Errors
    /// Returns `Error::ConfigError` if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        Ok(RedisLockBackend {
            pool: config.create_pool()?,
        })
    }

    pub fn from_pool(pool: Pool) -> Self {
        RedisLockBackend { pool }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::LockError(format!("Failed to get Redis connection: {}", e)))
    }
}

impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;

        // "OK" when set, nil when the key already exists
        let reply: Option<String> = cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg((ttl.as_millis() as u64).max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::LockError(format!("Redis SET NX failed for {}: {}", key, e)))?;

        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection().await?;

        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::LockError(format!("Redis lock release failed for {}: {}", key, e)))?;

        Ok(deleted == 1)
    }
}
