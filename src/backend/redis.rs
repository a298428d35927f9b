//! Redis cache tier.

use super::{CacheBackend, CacheEntry};
use crate::error::{Error, Result};
use deadpool_redis::redis::{cmd, pipe, RedisError};
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use std::time::{Duration, SystemTime};

/// Default Redis connection pool size.
/// Override with REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: usize = 16;

/// Configuration for the Redis tier (and the Redis bus and lock backends).
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Defaults overridden by `REDIS_URL` and `REDIS_POOL_SIZE`.
    pub fn from_env() -> Self {
        let mut config = RedisConfig::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.url = url;
        }
        if let Some(size) = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.pool_size = size;
        }
        config
    }

    /// Build a connection pool from this configuration.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the URL is invalid.
    pub fn create_pool(&self) -> Result<Pool> {
        let mut cfg = Config::from_url(self.url.clone());
        let mut pool_config = PoolConfig::new(self.pool_size);
        pool_config.timeouts.wait = Some(self.connection_timeout);
        cfg.pool = Some(pool_config);
        cfg.create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create Redis pool: {}", e)))
    }
}

/// Shared tier on Redis.
///
/// Expiry is delegated to Redis (`SET .. PX`); reads fetch the value and its
/// `PTTL` in one pipeline so the remaining lifetime can be carried into the
/// local tier on promotion.
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let pool = config.create_pool()?;
        info!(
            "✓ Redis tier initialized with {} (pool size: {})",
            config.url, config.pool_size
        );
        Ok(RedisBackend { pool })
    }

    /// Reuse an existing pool (e.g. shared with the bus and lock backends).
    pub fn from_pool(pool: Pool) -> Self {
        RedisBackend { pool }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }
}

fn backend_error(op: &str, key: &str, e: RedisError) -> Error {
    Error::BackendError(format!("Redis {} failed for key {}: {}", op, key, e))
}

impl CacheBackend for RedisBackend {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.connection().await?;

        let (value, pttl): (Option<Vec<u8>>, i64) = pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("GET", key, e))?;

        match value {
            Some(payload) => {
                debug!("✓ Redis GET {} -> HIT (pttl: {})", key, pttl);
                // -1: no expiry. -2: expired between GET and PTTL.
                let expires_at = match pttl {
                    -2 => return Ok(None),
                    ms if ms >= 0 => Some(SystemTime::now() + Duration::from_millis(ms as u64)),
                    _ => None,
                };
                Ok(Some(CacheEntry {
                    payload,
                    expires_at,
                }))
            }
            None => {
                debug!("✓ Redis GET {} -> MISS", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        if ttl == Some(Duration::ZERO) {
            return self.remove(key).await;
        }

        let mut conn = self.connection().await?;
        let mut command = cmd("SET");
        command.arg(key).arg(value);
        if let Some(ttl) = ttl {
            command.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }

        let _: () = command
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("SET", key, e))?;

        debug!("✓ Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("DEL", key, e))?;

        debug!("✓ Redis DEL {}", key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let count: i64 = cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("EXISTS", key, e))?;
        Ok(count > 0)
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis FLUSHDB failed: {}", e)))?;

        warn!("⚠ Redis FLUSHDB executed - all cache cleared!");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(_) => return Ok(false),
        };
        let pong: std::result::Result<String, RedisError> =
            cmd("PING").query_async(&mut conn).await;
        Ok(pong.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_default() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn test_create_pool_rejects_bad_url() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.create_pool(), Err(Error::ConfigError(_))));
    }
}
