//! Builders: wiring a [`HybridCache`] and configuring one cache-aside
//! operation.

use crate::aside::CacheAside;
use crate::backend::CacheBackend;
use crate::bus::{BusTransport, InvalidationBus, PublishSupervisor};
use crate::config::HybridCacheConfig;
use crate::coordinator::{HybridCache, LocalInvalidator, PromotionFence};
use crate::error::Result;
use crate::lock::LockBackend;
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::serialization::{CacheCodec, PostcardCodec};
use crate::strategy::CacheStrategy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const RETRY_BASE_DELAY_MS: u64 = 100;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Assembles a [`HybridCache`]: tiers, bus transport, codec, metrics.
///
/// `build` subscribes the Local tier to the bus and starts the background
/// publisher, so it must run inside a tokio runtime.
pub struct HybridCacheBuilder<L, R, T, C = PostcardCodec> {
    local: L,
    remote: R,
    transport: T,
    codec: C,
    config: HybridCacheConfig,
    metrics: Arc<dyn CacheMetrics>,
}

impl<L, R, T> HybridCacheBuilder<L, R, T, PostcardCodec>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
{
    pub fn new(local: L, remote: R, transport: T) -> Self {
        HybridCacheBuilder {
            local,
            remote,
            transport,
            codec: PostcardCodec,
            config: HybridCacheConfig::default(),
            metrics: Arc::new(NoOpMetrics),
        }
    }
}

impl<L, R, T, C> HybridCacheBuilder<L, R, T, C>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
{
    /// Use another value codec. Every node on a topic must agree on it.
    pub fn codec<C2: CacheCodec>(self, codec: C2) -> HybridCacheBuilder<L, R, T, C2> {
        HybridCacheBuilder {
            local: self.local,
            remote: self.remote,
            transport: self.transport,
            codec,
            config: self.config,
            metrics: self.metrics,
        }
    }

    pub fn config(mut self, config: HybridCacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Subscribe to the bus, start the publisher and return the cache.
    ///
    /// # Errors
    /// - `Error::ConfigError` for an invalid configuration
    /// - `Error::BusError` if the subscription cannot be established
    pub async fn build(self) -> Result<HybridCache<L, R, T, C>> {
        self.config.validate()?;

        let fence = Arc::new(PromotionFence::new());
        let invalidator = Arc::new(LocalInvalidator::new(
            self.local.clone(),
            Arc::clone(&fence),
            Arc::clone(&self.metrics),
            &self.config,
        ));
        let bus = Arc::new(InvalidationBus::new(
            self.transport,
            self.config.topic.clone(),
            self.config.node_id.clone(),
        ));

        let listener = Arc::clone(&invalidator);
        let subscription = bus
            .subscribe(move |message| {
                let listener = Arc::clone(&listener);
                async move { listener.on_message(message).await }
            })
            .await?;
        let publisher = PublishSupervisor::spawn(Arc::clone(&bus), self.config.publish_queue_capacity);

        info!(
            "✓ Hybrid cache ready (topic: {}, node: {}, codec: {})",
            self.config.topic,
            self.config.node_id,
            self.codec.name()
        );

        Ok(HybridCache::assemble(
            self.local,
            self.remote,
            self.codec,
            self.config,
            self.metrics,
            fence,
            bus,
            publisher,
            invalidator,
            subscription,
        ))
    }
}

/// Fluent builder for one cache-aside operation.
///
/// Provides chainable methods to configure strategy, TTL override and retry.
///
/// # Example
///
/// ```ignore
/// let user: Option<User> = aside
///     .operation("user:42")
///     .with_strategy(CacheStrategy::Refresh)
///     .with_ttl(Duration::from_secs(300))
///     .with_retry(3)
///     .execute(|| repo.fetch_user(42))
///     .await?;
/// ```
pub struct CacheOperationBuilder<'a, L, R, T, C, K>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
    K: LockBackend,
{
    aside: &'a CacheAside<L, R, T, C, K>,
    key: String,
    strategy: CacheStrategy,
    ttl_override: Option<Duration>,
    retry_count: u32,
}

impl<'a, L, R, T, C, K> CacheOperationBuilder<'a, L, R, T, C, K>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
    K: LockBackend,
{
    pub(crate) fn new(aside: &'a CacheAside<L, R, T, C, K>, key: &str) -> Self {
        Self {
            aside,
            key: key.to_string(),
            strategy: CacheStrategy::Refresh,
            ttl_override: None,
            retry_count: 0,
        }
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Override the TTL policy for this operation.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    /// Retry transient failures up to `count` more times.
    pub fn with_retry(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Run the operation. `factory` may be called once per attempt.
    ///
    /// Returns `Ok(None)` only for [`CacheStrategy::Fresh`] on a miss.
    ///
    /// # Errors
    ///
    /// The last error once retries are exhausted. Only transient errors
    /// (`is_transient()`) are retried, with exponential backoff starting at
    /// 100ms; corruption, validation and factory errors return immediately
    /// unless the factory reports a transient error itself.
    pub async fn execute<V, F, Fut>(self, factory: F) -> Result<Option<V>>
    where
        V: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let ttl = self
            .ttl_override
            .unwrap_or_else(|| self.aside.ttl_for(&self.key));
        let max_attempts = self.retry_count.saturating_add(1);
        let mut attempts = 0;

        debug!(
            "» Cache operation for key: {} (strategy: {})",
            self.key, self.strategy
        );

        loop {
            attempts += 1;

            match self.run_once(ttl, &factory).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempts >= max_attempts || !e.is_transient() {
                        return Err(e);
                    }

                    debug!(
                        "Cache operation on {} failed (attempt {}/{}), retrying: {}",
                        self.key, attempts, max_attempts, e
                    );
                    tokio::time::sleep(retry_delay(attempts)).await;
                }
            }
        }
    }

    async fn run_once<V, F, Fut>(&self, ttl: Duration, factory: &F) -> Result<Option<V>>
    where
        V: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let cache = self.aside.cache();
        match self.strategy {
            CacheStrategy::Fresh => cache.get(&self.key).await,
            CacheStrategy::Refresh => self
                .aside
                .get_or_compute_with_ttl(&self.key, ttl, factory)
                .await
                .map(Some),
            CacheStrategy::Invalidate => {
                cache.remove(&self.key).await?;
                let value = factory().await?;
                cache.store_computed(&self.key, &value, ttl).await?;
                Ok(Some(value))
            }
            CacheStrategy::Bypass => {
                let value = factory().await?;
                cache.store_computed(&self.key, &value, ttl).await?;
                Ok(Some(value))
            }
        }
    }
}

/// Delay before retry number `attempt` (1-based): 100ms doubling, capped.
fn retry_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(1 << exponent)).min(MAX_RETRY_DELAY)
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::bus::InMemoryTransport;
    use crate::error::Error;
    use crate::serialization::JsonCodec;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn aside() -> CacheAside<InMemoryBackend, InMemoryBackend, InMemoryTransport> {
        let cache = HybridCache::builder(
            InMemoryBackend::new(),
            InMemoryBackend::new(),
            InMemoryTransport::new(),
        )
        .config(HybridCacheConfig::new("builder-test"))
        .build()
        .await
        .expect("Failed to build cache");
        CacheAside::new(cache)
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let result = HybridCache::builder(
            InMemoryBackend::new(),
            InMemoryBackend::new(),
            InMemoryTransport::new(),
        )
        .config(HybridCacheConfig::new(""))
        .build()
        .await;
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_build_with_json_codec() {
        let cache = HybridCache::builder(
            InMemoryBackend::new(),
            InMemoryBackend::new(),
            InMemoryTransport::new(),
        )
        .codec(JsonCodec)
        .build()
        .await
        .expect("build");

        cache
            .set("k", &vec![1, 2, 3], Duration::from_secs(60))
            .await
            .expect("set");
        let raw = cache.remote().get("k").await.expect("get").expect("bytes");
        assert_eq!(raw, b"[1,2,3]".to_vec());
        assert!(cache.is_subscribed());
    }

    #[tokio::test]
    async fn test_fresh_never_computes() {
        let aside = aside().await;
        let value: Option<String> = aside
            .operation("k")
            .with_strategy(CacheStrategy::Fresh)
            .execute(|| async { Ok("computed".to_string()) })
            .await
            .expect("execute");
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_refresh_computes_once() {
        let aside = aside().await;
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let value = aside
                .operation("k")
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(5u32)
                })
                .await
                .expect("execute");
            assert_eq!(value, Some(5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_bypass_recompute() {
        let aside = aside().await;
        aside
            .cache()
            .set("k", &1u32, Duration::from_secs(60))
            .await
            .expect("set");

        let value = aside
            .operation("k")
            .with_strategy(CacheStrategy::Invalidate)
            .execute(|| async { Ok(2u32) })
            .await
            .expect("execute");
        assert_eq!(value, Some(2));
        assert_eq!(aside.cache().get::<u32>("k").await.expect("get"), Some(2));

        let value = aside
            .operation("k")
            .with_strategy(CacheStrategy::Bypass)
            .with_ttl(Duration::from_secs(5))
            .execute(|| async { Ok(3u32) })
            .await
            .expect("execute");
        assert_eq!(value, Some(3));
        let entry = aside
            .cache()
            .remote()
            .get_entry("k")
            .await
            .expect("get")
            .expect("entry");
        assert!(entry.remaining_ttl().expect("ttl") <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let aside = aside().await;
        let calls = AtomicU32::new(0);

        let value = aside
            .operation("k")
            .with_strategy(CacheStrategy::Bypass)
            .with_retry(2)
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Timeout("upstream slow".to_string()))
                } else {
                    Ok(9u32)
                }
            })
            .await
            .expect("execute");
        assert_eq!(value, Some(9));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let aside = aside().await;
        let calls = AtomicU32::new(0);

        let result: Result<Option<u32>> = aside
            .operation("k")
            .with_retry(3)
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::ValidationError("bad id".to_string()))
            })
            .await;
        assert!(matches!(result, Err(Error::ValidationError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        assert_eq!(retry_delay(1), Duration::from_millis(100));
        assert_eq!(retry_delay(2), Duration::from_millis(200));
        assert_eq!(retry_delay(4), Duration::from_millis(800));
        assert_eq!(retry_delay(64), MAX_RETRY_DELAY);
        assert_eq!(retry_delay(u32::MAX), MAX_RETRY_DELAY);
    }
}
