//! Cache-aside entry point and method decorator.
//!
//! ```text
//! get_or_compute(k):
//!   cache hit ─────────────────────────────────► value
//!   miss ─► lock(k) ─acquired─► re-check ─hit──► value
//!              │                   └─miss─► compute, store, release
//!              └─timeout─► re-check ─hit──► value
//!                             └─miss─► compute, store (unguarded)
//! ```

use crate::backend::CacheBackend;
use crate::builder::CacheOperationBuilder;
use crate::bus::BusTransport;
use crate::coordinator::HybridCache;
use crate::error::Result;
use crate::key::CacheKeyBuilder;
use crate::lock::{DistributedLockFactory, LockBackend};
use crate::observability::TtlPolicy;
use crate::serialization::{CacheCodec, PostcardCodec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Lock resource under which stampede locks are taken.
const STAMPEDE_RESOURCE: &str = "cache-aside";

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Lock backend for a [`CacheAside`] without stampede protection.
///
/// Never consulted: a `CacheAside` built by [`CacheAside::new`] holds no
/// lock factory.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLock;

impl LockBackend for NoLock {
    async fn try_acquire(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self, _key: &str, _token: &str) -> Result<bool> {
        Ok(true)
    }
}

/// "Get or compute" over a [`HybridCache`], optionally guarded by a
/// distributed lock so only one caller recomputes a missing key.
pub struct CacheAside<L, R, T, C = PostcardCodec, K = NoLock>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
    K: LockBackend,
{
    cache: HybridCache<L, R, T, C>,
    locks: Option<DistributedLockFactory<K>>,
    lock_timeout_ms: u64,
    ttl_policy: TtlPolicy,
}

impl<L, R, T, C, K> Clone for CacheAside<L, R, T, C, K>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
    K: LockBackend,
{
    fn clone(&self) -> Self {
        CacheAside {
            cache: self.cache.clone(),
            locks: self.locks.clone(),
            lock_timeout_ms: self.lock_timeout_ms,
            ttl_policy: self.ttl_policy.clone(),
        }
    }
}

impl<L, R, T, C> CacheAside<L, R, T, C, NoLock>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
{
    pub fn new(cache: HybridCache<L, R, T, C>) -> Self {
        CacheAside {
            cache,
            locks: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            ttl_policy: TtlPolicy::default(),
        }
    }
}

impl<L, R, T, C, K> CacheAside<L, R, T, C, K>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
    K: LockBackend,
{
    /// Guard recomputation with `locks`, waiting up to `timeout_ms` for a
    /// peer that is already computing the same key.
    pub fn with_lock<K2: LockBackend>(
        self,
        locks: DistributedLockFactory<K2>,
        timeout_ms: u64,
    ) -> CacheAside<L, R, T, C, K2> {
        CacheAside {
            cache: self.cache,
            locks: Some(locks),
            lock_timeout_ms: timeout_ms,
            ttl_policy: self.ttl_policy,
        }
    }

    pub fn with_ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl_policy = policy;
        self
    }

    pub fn cache(&self) -> &HybridCache<L, R, T, C> {
        &self.cache
    }

    /// TTL for `key` from the policy, keyed by the part before the first `:`.
    pub fn ttl_for(&self, key: &str) -> Duration {
        let prefix = CacheKeyBuilder::parse(key)
            .map(|(prefix, _)| prefix)
            .unwrap_or(key);
        self.ttl_policy
            .get_ttl(prefix)
            .unwrap_or(self.cache.config().default_ttl)
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// # Errors
    /// Cache read errors (corruption included) and the factory's own error.
    /// Lock backend failures degrade to an unguarded computation.
    pub async fn get_or_compute<V, F, Fut>(&self, key: &str, factory: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.get_or_compute_with_ttl(key, self.ttl_for(key), factory)
            .await
    }

    pub(crate) async fn get_or_compute_with_ttl<V, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
    ) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let Some(locks) = &self.locks else {
            return self.cache.get_or_compute(key, ttl, factory).await;
        };

        if let Some(value) = self.cache.get(key).await? {
            return Ok(value);
        }

        let mut lock = locks.create_lock(STAMPEDE_RESOURCE, key);
        match lock.lock(self.lock_timeout_ms).await {
            Ok(true) => {
                // A peer may have filled the key while we waited
                let result = self.cache.get_or_compute(key, ttl, factory).await;
                if let Err(e) = lock.release().await {
                    warn!("⚠ Failed to release stampede lock for {}: {}", key, e);
                }
                result
            }
            Ok(false) => {
                warn!(
                    "⚠ Stampede lock for {} not acquired in {}ms, computing unguarded",
                    key, self.lock_timeout_ms
                );
                self.cache.get_or_compute(key, ttl, factory).await
            }
            Err(e) => {
                warn!(
                    "⚠ Stampede lock for {} failed, computing unguarded: {}",
                    key, e
                );
                self.cache.get_or_compute(key, ttl, factory).await
            }
        }
    }

    /// Configure a single operation (strategy, TTL, retries) on `key`.
    pub fn operation(&self, key: &str) -> CacheOperationBuilder<'_, L, R, T, C, K> {
        CacheOperationBuilder::new(self, key)
    }

    /// Decorate one logical method: calls are cached under
    /// `"{prefix}:{method}:{args..}"`.
    pub fn method(&self, prefix: &str, method: &str) -> CachedMethod<L, R, T, C, K> {
        CachedMethod {
            aside: self.clone(),
            prefix: prefix.to_string(),
            method: method.to_string(),
        }
    }
}

/// Caching wrapper around one method identity.
///
/// # Example
///
/// ```ignore
/// let find_user = aside.method("users", "find_by_email");
///
/// let user: User = find_user
///     .call(&[&email], || repo.find_by_email(&email))
///     .await?;
/// find_user.evict(&[&email]).await?;
/// ```
pub struct CachedMethod<L, R, T, C, K>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
    K: LockBackend,
{
    aside: CacheAside<L, R, T, C, K>,
    prefix: String,
    method: String,
}

impl<L, R, T, C, K> CachedMethod<L, R, T, C, K>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
    K: LockBackend,
{
    pub fn key(&self, args: &[&(dyn Display + Sync)]) -> String {
        CacheKeyBuilder::method_key(&self.prefix, &self.method, args)
    }

    /// Cached result for `args`, running `body` on a miss.
    pub async fn call<V, F, Fut>(&self, args: &[&(dyn Display + Sync)], body: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let key = self.key(args);
        self.aside.get_or_compute(&key, body).await
    }

    /// Store `value` as the result for `args`.
    pub async fn put<V: Serialize>(&self, args: &[&(dyn Display + Sync)], value: &V) -> Result<()> {
        let key = self.key(args);
        let ttl = self.aside.ttl_for(&key);
        self.aside.cache().set(&key, value, ttl).await
    }

    /// Drop the cached result for `args` on every node.
    pub async fn evict(&self, args: &[&(dyn Display + Sync)]) -> Result<()> {
        let key = self.key(args);
        self.aside.cache().remove(&key).await
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::bus::InMemoryTransport;
    use crate::config::{HybridCacheConfig, LockConfig};
    use crate::error::Error;
    use crate::lock::InMemoryLockBackend;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    type Cache = HybridCache<InMemoryBackend, InMemoryBackend, InMemoryTransport>;

    async fn cache() -> Cache {
        HybridCache::builder(
            InMemoryBackend::new(),
            InMemoryBackend::new(),
            InMemoryTransport::new(),
        )
        .config(HybridCacheConfig::new("aside-test"))
        .build()
        .await
        .expect("Failed to build cache")
    }

    fn session_ttl(prefix: &str) -> Duration {
        match prefix {
            "session" => Duration::from_secs(30),
            _ => Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_ttl_policy_by_prefix() {
        let aside = CacheAside::new(cache().await).with_ttl_policy(TtlPolicy::PerType(session_ttl));
        assert_eq!(aside.ttl_for("session:1"), Duration::from_secs(30));
        assert_eq!(aside.ttl_for("user:1"), Duration::from_secs(3600));

        let default = CacheAside::new(cache().await);
        assert_eq!(default.ttl_for("user:1"), default.cache().config().default_ttl);
    }

    #[tokio::test]
    async fn test_get_or_compute_without_lock() {
        let aside = CacheAside::new(cache().await);
        let value = aside
            .get_or_compute("user:1", || async { Ok("alice".to_string()) })
            .await
            .expect("compute");
        assert_eq!(value, "alice");
        assert_eq!(
            aside.cache().get::<String>("user:1").await.expect("get"),
            Some("alice".to_string())
        );
    }

    #[tokio::test]
    async fn test_lock_prevents_stampede() {
        let locks = DistributedLockFactory::with_config(
            InMemoryLockBackend::new(),
            LockConfig::default().with_retry(Duration::from_millis(2), Duration::from_millis(10)),
        );
        let aside = CacheAside::new(cache().await).with_lock(locks, 2_000);
        let calls = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let aside = aside.clone();
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                aside
                    .get_or_compute("report:q1", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(1234u64)
                    })
                    .await
                    .expect("compute")
            }));
        }

        for task in tasks {
            assert_eq!(task.await.expect("join"), 1234);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_timeout_computes_unguarded() {
        let backend = InMemoryLockBackend::new();
        let locks = DistributedLockFactory::new(backend.clone());
        let aside = CacheAside::new(cache().await).with_lock(locks.clone(), 20);

        // Someone else holds the stampede lock and never fills the key
        let mut holder = locks.create_lock(STAMPEDE_RESOURCE, "k");
        assert!(holder.lock(10).await.expect("lock"));

        let value = aside
            .get_or_compute("k", || async { Ok(7u8) })
            .await
            .expect("compute");
        assert_eq!(value, 7);
        holder.release().await.expect("release");
    }

    #[tokio::test]
    async fn test_factory_error_is_propagated_and_lock_released() {
        let locks = DistributedLockFactory::new(InMemoryLockBackend::new());
        let aside = CacheAside::new(cache().await).with_lock(locks.clone(), 100);

        let result: Result<u8> = aside
            .get_or_compute("k", || async { Err(Error::NotFound("row".to_string())) })
            .await;
        assert_eq!(result, Err(Error::NotFound("row".to_string())));

        let mut next = locks.create_lock(STAMPEDE_RESOURCE, "k");
        assert!(next.lock(100).await.expect("lock"));
    }

    #[tokio::test]
    async fn test_cached_method() {
        let aside = CacheAside::new(cache().await);
        let find = aside.method("users", "find_by_email");
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let name: String = find
                .call(&[&"a@example.com"], || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("alice".to_string())
                })
                .await
                .expect("call");
            assert_eq!(name, "alice");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(find.key(&[&"a@example.com"]), "users:find_by_email:a@example.com");

        find.put(&[&"a@example.com"], &"alicia".to_string())
            .await
            .expect("put");
        let name: String = find
            .call(&[&"a@example.com"], || async { Ok("unused".to_string()) })
            .await
            .expect("call");
        assert_eq!(name, "alicia");

        find.evict(&[&"a@example.com"]).await.expect("evict");
        assert!(!aside
            .cache()
            .exists("users:find_by_email:a@example.com")
            .await
            .expect("exists"));
    }
}
