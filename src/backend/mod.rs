//! Cache tier backends.
//!
//! Every tier (the process-local one and the shared one) implements
//! [`CacheBackend`]. Payloads are opaque bytes; expiration is absolute and an
//! expired entry is never returned, even if the store still holds it.

use crate::error::Result;
use std::future::Future;
use std::time::{Duration, SystemTime};

mod blocking;
#[cfg(feature = "inmemory")]
mod inmemory;
#[cfg(feature = "memcached")]
mod memcached;
#[cfg(feature = "redis")]
mod redis;

pub use blocking::BlockingBackend;
pub(crate) use blocking::blocking_runtime;
#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryBackend;
#[cfg(feature = "memcached")]
pub use memcached::{MemcachedBackend, MemcachedConfig};
#[cfg(feature = "redis")]
pub use redis::{RedisBackend, RedisConfig};

/// Which tier served or failed an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Local,
    Remote,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Remote => write!(f, "remote"),
        }
    }
}

/// One stored value together with its absolute expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: Vec<u8>,
    /// `None` means the entry never expires on its own.
    pub expires_at: Option<SystemTime>,
}

impl CacheEntry {
    /// Build an entry that expires `ttl` from now.
    pub fn new(payload: Vec<u8>, ttl: Option<Duration>) -> Self {
        CacheEntry {
            payload,
            expires_at: ttl.map(|ttl| SystemTime::now() + ttl),
        }
    }

    /// Whether the entry is logically absent at `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Time left before expiry, recomputed from `expires_at`.
    ///
    /// Returns `None` for entries without expiry and `Some(Duration::ZERO)`
    /// for expired ones.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at.map(|at| {
            at.duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }
}

/// Key-value contract every cache tier satisfies.
///
/// All futures are cancel-safe in the sense that dropping them aborts the
/// pending I/O; whether the store applied a write that was in flight is
/// unknown to the caller.
///
/// Only `get_entry`, `set`, `remove` and `clear_all` are required.
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetch a live entry with its expiry.
    fn get_entry(&self, key: &str) -> impl Future<Output = Result<Option<CacheEntry>>> + Send;

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// `ttl = None` stores without expiry.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete `key`; a missing key is not an error.
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Drop every entry in the tier.
    fn clear_all(&self) -> impl Future<Output = Result<()>> + Send;

    /// Fetch a live payload.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send {
        async move { Ok(self.get_entry(key).await?.map(|entry| entry.payload)) }
    }

    /// Whether a live entry exists.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get_entry(key).await?.is_some()) }
    }

    /// Fetch several payloads, preserving input order.
    fn mget(&self, keys: &[&str]) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.get(key).await?);
            }
            Ok(results)
        }
    }

    /// Delete several keys.
    fn mremove(&self, keys: &[&str]) -> impl Future<Output = Result<()>> + Send {
        async move {
            for key in keys {
                self.remove(key).await?;
            }
            Ok(())
        }
    }

    /// Cheap liveness probe.
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }
}
