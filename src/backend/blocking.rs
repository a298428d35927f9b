//! Blocking form of the tier contract.

use super::{CacheBackend, CacheEntry};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Synchronous wrapper around any [`CacheBackend`].
///
/// Owns (or shares) a tokio runtime and blocks the calling thread on each
/// operation. Semantics are identical to the async form. Must not be called
/// from inside an async context.
pub struct BlockingBackend<B: CacheBackend> {
    runtime: Arc<Runtime>,
    backend: B,
}

impl<B: CacheBackend> BlockingBackend<B> {
    /// Wrap `backend` with a dedicated single-worker runtime.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the runtime cannot be started.
    pub fn new(backend: B) -> Result<Self> {
        Ok(Self::with_runtime(backend, Arc::new(blocking_runtime()?)))
    }

    /// Wrap `backend` sharing an existing runtime.
    pub fn with_runtime(backend: B, runtime: Arc<Runtime>) -> Self {
        BlockingBackend { runtime, backend }
    }

    pub fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.runtime.block_on(self.backend.get_entry(key))
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.runtime.block_on(self.backend.get(key))
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.runtime.block_on(self.backend.set(key, value, ttl))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.runtime.block_on(self.backend.remove(key))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.runtime.block_on(self.backend.exists(key))
    }

    pub fn clear_all(&self) -> Result<()> {
        self.runtime.block_on(self.backend.clear_all())
    }

    /// Access the wrapped async backend.
    pub fn inner(&self) -> &B {
        &self.backend
    }
}

/// Runtime used by the blocking facades: one worker so that background
/// tasks (bus subscription, publisher) keep running between calls.
pub(crate) fn blocking_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("hybrid-cache-blocking")
        .enable_all()
        .build()
        .map_err(|e| Error::ConfigError(format!("Failed to start tokio runtime: {}", e)))
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[test]
    fn test_blocking_round_trip() {
        let backend = BlockingBackend::new(InMemoryBackend::new()).expect("runtime");

        backend
            .set("k", b"v".to_vec(), Some(Duration::from_secs(60)))
            .expect("set");
        assert!(backend.exists("k").expect("exists"));

        let entry = backend.get_entry("k").expect("get").expect("entry");
        assert_eq!(entry.payload, b"v".to_vec());
        assert!(entry.remaining_ttl().expect("ttl") <= Duration::from_secs(60));

        backend.remove("k").expect("remove");
        assert_eq!(backend.get("k").expect("get"), None);
    }

    #[test]
    fn test_blocking_shares_state_with_async_backend() {
        let inner = InMemoryBackend::new();
        let backend = BlockingBackend::new(inner.clone()).expect("runtime");

        backend.set("k", b"v".to_vec(), None).expect("set");
        backend.clear_all().expect("clear");
        assert!(!backend.exists("k").expect("exists"));
        assert!(backend.runtime.block_on(inner.is_empty()));
    }
}
