//! Blocking facade over [`HybridCache`].

use crate::backend::{blocking_runtime, CacheBackend};
use crate::builder::HybridCacheBuilder;
use crate::bus::BusTransport;
use crate::coordinator::HybridCache;
use crate::error::Result;
use crate::serialization::{CacheCodec, PostcardCodec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Synchronous hybrid cache for callers outside any async runtime.
///
/// Owns a runtime whose worker keeps the bus subscription and the publisher
/// running between calls. Must not be used from inside an async context.
pub struct BlockingHybridCache<L, R, T, C = PostcardCodec>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
{
    cache: HybridCache<L, R, T, C>,
    runtime: Arc<Runtime>,
}

impl<L, R, T, C> BlockingHybridCache<L, R, T, C>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
{
    /// Build the cache on a dedicated runtime.
    ///
    /// # Errors
    /// Runtime start-up failures and everything
    /// [`HybridCacheBuilder::build`] returns.
    pub fn new(builder: HybridCacheBuilder<L, R, T, C>) -> Result<Self> {
        let runtime = Arc::new(blocking_runtime()?);
        let cache = runtime.block_on(builder.build())?;
        Ok(BlockingHybridCache { cache, runtime })
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        self.runtime.block_on(self.cache.get(key))
    }

    /// Blocking form of [`HybridCache::get_or_compute`] with a synchronous
    /// factory.
    pub fn get_or_compute<V, F>(&self, key: &str, ttl: Duration, factory: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<V>,
    {
        self.runtime
            .block_on(self.cache.get_or_compute(key, ttl, move || async move { factory() }))
    }

    pub fn set<V: Serialize>(&self, key: &str, value: &V, ttl: Duration) -> Result<()> {
        self.runtime.block_on(self.cache.set(key, value, ttl))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.runtime.block_on(self.cache.remove(key))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.runtime.block_on(self.cache.exists(key))
    }

    pub fn clear(&self) -> Result<()> {
        self.runtime.block_on(self.cache.clear())
    }

    pub fn flush_publishes(&self) -> Result<()> {
        self.runtime.block_on(self.cache.flush_publishes())
    }

    /// The async cache, for handing to code that runs on [`runtime`](Self::runtime).
    pub fn inner(&self) -> &HybridCache<L, R, T, C> {
        &self.cache
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }
}
