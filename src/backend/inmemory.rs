//! In-process cache tier backed by a sharded `DashMap`.

use super::{CacheBackend, CacheEntry};
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// In-memory tier.
///
/// Cloning is cheap and clones share the same map, so one instance can be
/// handed to the coordinator and to the invalidation listener. `DashMap`
/// shards keys across independent locks: unrelated keys never contend.
///
/// Expired entries are purged lazily when read.
///
/// # Example
///
/// ```
/// # use hybrid_cache_kit::backend::{CacheBackend, InMemoryBackend};
/// # async fn example() -> hybrid_cache_kit::Result<()> {
/// let backend = InMemoryBackend::new();
/// backend.set("key", b"value".to_vec(), None).await?;
/// assert_eq!(backend.get("key").await?, Some(b"value".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, CacheEntry>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.is_expired_at(now));
        before.saturating_sub(self.store.len())
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = SystemTime::now();
        let expired = match self.store.get(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                debug!("✓ InMemory GET {} -> HIT", key);
                return Ok(Some(entry.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            // Re-check under the shard lock: a writer may have replaced it.
            self.store
                .remove_if(key, |_, entry| entry.is_expired_at(SystemTime::now()));
            debug!("InMemory GET {} -> EXPIRED", key);
        } else {
            debug!("InMemory GET {} -> MISS", key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        if ttl == Some(Duration::ZERO) {
            self.store.remove(key);
            return Ok(());
        }
        self.store
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        debug!("✓ InMemory SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        debug!("✓ InMemory REMOVE {}", key);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.store.clear();
        warn!("⚠ InMemory CLEAR_ALL executed");
        Ok(())
    }
}
