//! Memcached cache tier.
//!
//! Memcached cannot report how long an item has left to live, and promotion
//! into the local tier needs exactly that. Each stored value therefore
//! carries its own expiry:
//!
//! ```text
//! [EXPIRES_AT_MS: u64 BE, 0 = never] [PAYLOAD]
//! ```
//!
//! The server-side expiration is still set so memcached reclaims memory.

use super::{CacheBackend, CacheEntry};
use crate::error::{Error, Result};
use async_memcached::AsciiProtocol;
use deadpool_memcached::{Manager, Pool};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default Memcached connection pool size.
/// Override with MEMCACHED_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Relative expirations above this are read by memcached as unix timestamps.
const MAX_RELATIVE_EXPIRATION_SECS: u64 = 60 * 60 * 24 * 30;

const EXPIRY_HEADER_LEN: usize = 8;

/// Configuration for Memcached backend.
#[derive(Clone, Debug)]
pub struct MemcachedConfig {
    pub servers: Vec<String>, // e.g., ["localhost:11211", "cache2:11211"]
    pub connection_timeout: Duration,
    pub pool_size: u32,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        MemcachedConfig {
            servers: vec!["localhost:11211".to_string()],
            connection_timeout: Duration::from_secs(5),
            pool_size: 10,
        }
    }
}

impl MemcachedConfig {
    /// Defaults overridden by `MEMCACHED_SERVERS` (comma separated) and
    /// `MEMCACHED_POOL_SIZE`.
    pub fn from_env() -> Self {
        let mut config = MemcachedConfig::default();
        if let Ok(servers) = std::env::var("MEMCACHED_SERVERS") {
            let servers: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !servers.is_empty() {
                config.servers = servers;
            }
        }
        config.pool_size = std::env::var("MEMCACHED_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);
        config
    }
}

/// Shared tier on Memcached with connection pooling.
///
/// # Example
///
/// ```no_run
/// # use hybrid_cache_kit::backend::{MemcachedBackend, MemcachedConfig, CacheBackend};
/// # use hybrid_cache_kit::error::Result;
/// # use std::time::Duration;
/// # async fn example() -> Result<()> {
/// let backend = MemcachedBackend::new(MemcachedConfig::from_env()).await?;
/// backend.set("key", b"value".to_vec(), Some(Duration::from_secs(60))).await?;
/// let entry = backend.get_entry("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemcachedBackend {
    pool: Pool,
}

impl MemcachedBackend {
    /// Create new Memcached backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub async fn new(config: MemcachedConfig) -> Result<Self> {
        // deadpool-memcached Manager takes a single server address
        let addr = config
            .servers
            .first()
            .ok_or_else(|| Error::ConfigError("No memcached servers specified".to_string()))?
            .clone();

        let manager = Manager::new(addr.clone());

        let pool = Pool::builder(manager)
            .max_size(config.pool_size as usize)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        info!(
            "✓ Memcached tier initialized with server: {} (pool size: {})",
            addr, config.pool_size
        );

        Ok(MemcachedBackend { pool })
    }
}

fn encode_stored(entry: &CacheEntry) -> Vec<u8> {
    let expires_ms = entry
        .expires_at
        .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut out = Vec::with_capacity(EXPIRY_HEADER_LEN + entry.payload.len());
    out.extend_from_slice(&expires_ms.to_be_bytes());
    out.extend_from_slice(&entry.payload);
    out
}

fn decode_stored(key: &str, mut bytes: Vec<u8>) -> Result<CacheEntry> {
    if bytes.len() < EXPIRY_HEADER_LEN {
        return Err(Error::InvalidCacheEntry(format!(
            "Memcached value for {} is missing its expiry header",
            key
        )));
    }

    let mut header = [0u8; EXPIRY_HEADER_LEN];
    header.copy_from_slice(&bytes[..EXPIRY_HEADER_LEN]);
    let expires_ms = u64::from_be_bytes(header);
    let payload = bytes.split_off(EXPIRY_HEADER_LEN);

    Ok(CacheEntry {
        payload,
        expires_at: (expires_ms > 0).then(|| UNIX_EPOCH + Duration::from_millis(expires_ms)),
    })
}

/// Server-side expiration in memcached's format, rounded up to whole seconds.
fn server_expiration(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    if secs <= MAX_RELATIVE_EXPIRATION_SECS {
        secs as i64
    } else {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        (now + secs) as i64
    }
}

impl CacheBackend for MemcachedBackend {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })?;

        match conn.get(key).await {
            Ok(Some(value)) => match value.data {
                Some(data) => {
                    let entry = decode_stored(key, data)?;
                    if entry.is_expired() {
                        debug!("Memcached GET {} -> EXPIRED", key);
                        return Ok(None);
                    }
                    debug!("✓ Memcached GET {} -> HIT", key);
                    Ok(Some(entry))
                }
                None => Ok(None),
            },
            Ok(None) => {
                debug!("✓ Memcached GET {} -> MISS", key);
                Ok(None)
            }
            Err(e) => Err(Error::BackendError(format!(
                "Memcached GET failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        if ttl == Some(Duration::ZERO) {
            return self.remove(key).await;
        }

        let mut conn = self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })?;
        let stored = encode_stored(&CacheEntry::new(value, ttl));
        let expiration = ttl.map(server_expiration);

        // Parameter order: set(key, value, ttl, flags)
        conn.set(key, stored.as_slice(), expiration, None)
            .await
            .map_err(|e| {
                Error::BackendError(format!("Memcached SET failed for key {}: {}", key, e))
            })?;

        debug!("✓ Memcached SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })?;

        match conn.delete(key).await {
            Ok(()) => {}
            // A missing key is reported as an error by the ascii protocol
            Err(e) if e.to_string().contains("not found") => {}
            Err(e) => {
                return Err(Error::BackendError(format!(
                    "Memcached DELETE failed for key {}: {}",
                    key, e
                )))
            }
        }

        debug!("✓ Memcached DELETE {}", key);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })?;

        conn.flush_all()
            .await
            .map_err(|e| Error::BackendError(format!("Memcached FLUSH_ALL failed: {}", e)))?;

        warn!("⚠ Memcached FLUSH_ALL executed - all cache cleared!");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.pool.get().await {
            Ok(mut conn) => Ok(conn.get("__health_check__").await.is_ok()),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memcached_config_default() {
        let config = MemcachedConfig::default();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0], "localhost:11211");
        assert_eq!(config.pool_size, 10);
    }

    #[test]
    fn test_stored_value_keeps_expiry() {
        let entry = CacheEntry::new(b"payload".to_vec(), Some(Duration::from_secs(90)));
        let stored = encode_stored(&entry);
        assert_eq!(stored.len(), EXPIRY_HEADER_LEN + 7);

        let decoded = decode_stored("k", stored).expect("decode");
        assert_eq!(decoded.payload, b"payload".to_vec());
        let remaining = decoded.remaining_ttl().expect("ttl");
        assert!(remaining <= Duration::from_secs(90));
        assert!(remaining > Duration::from_secs(85));
    }

    #[test]
    fn test_stored_value_without_expiry() {
        let stored = encode_stored(&CacheEntry::new(b"x".to_vec(), None));
        let decoded = decode_stored("k", stored).expect("decode");
        assert_eq!(decoded.expires_at, None);
    }

    #[test]
    fn test_truncated_stored_value() {
        assert!(matches!(
            decode_stored("k", vec![0, 1, 2]),
            Err(Error::InvalidCacheEntry(_))
        ));
    }

    #[test]
    fn test_server_expiration_rounds_up() {
        assert_eq!(server_expiration(Duration::from_millis(100)), 1);
        assert_eq!(server_expiration(Duration::from_secs(60)), 60);
        assert!(server_expiration(Duration::from_secs(MAX_RELATIVE_EXPIRATION_SECS + 1)) > 1_000_000_000);
    }
}
