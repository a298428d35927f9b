//! In-process lock backend.

use super::LockBackend;
use crate::error::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Lease {
    token: String,
    expires_at: Instant,
}

/// Lock leases kept in a shared map. Clones see the same leases.
///
/// Only excludes callers inside one process; use the Redis backend across
/// nodes.
#[derive(Clone, Default)]
pub struct InMemoryLockBackend {
    leases: Arc<DashMap<String, Lease>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leases currently stored, expired ones included.
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let lease = Lease {
            token: token.to_string(),
            expires_at: now + ttl,
        };

        let acquired = match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                true
            }
        };
        Ok(acquired)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.token == token)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_live_lease_blocks_other_tokens() {
        let backend = InMemoryLockBackend::new();
        let ttl = Duration::from_secs(10);

        assert!(backend.try_acquire("k", "a", ttl).await.expect("acquire"));
        assert!(!backend.try_acquire("k", "b", ttl).await.expect("acquire"));
        assert!(backend.try_acquire("other", "b", ttl).await.expect("acquire"));
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let backend = InMemoryLockBackend::new();
        backend
            .try_acquire("k", "a", Duration::from_secs(10))
            .await
            .expect("acquire");

        assert!(!backend.release("k", "b").await.expect("release"));
        assert!(backend.release("k", "a").await.expect("release"));
        assert!(!backend.release("k", "a").await.expect("release"));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let backend = InMemoryLockBackend::new();
        backend
            .try_acquire("k", "a", Duration::from_millis(10))
            .await
            .expect("acquire");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(backend
            .try_acquire("k", "b", Duration::from_secs(10))
            .await
            .expect("acquire"));
        assert!(!backend.release("k", "a").await.expect("release"));
    }
}
