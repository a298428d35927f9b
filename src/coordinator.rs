//! Hybrid cache coordinator: the two-tier read/write/evict algorithm.
//!
//! ```text
//! get(k):     Local ──hit──► value
//!               │miss
//!               ▼
//!             Remote ──hit──► promote into Local (remaining TTL) ──► value
//!               │miss
//!               ▼
//!             None (or compute, store Remote then Local)
//!
//! set(k, v):  Remote ──ok──► Local ──► publish Updated
//! remove(k):  Remote ──ok──► Local ──► publish Removed
//! ```
//!
//! Remote is the durability authority: a failed Remote write aborts before
//! Local is touched. Local is a pure optimisation: its failures are logged
//! and swallowed. Peers learn about writes through the invalidation bus and
//! always *evict*; the next read on a peer refetches from Remote.

use crate::backend::{CacheBackend, CacheEntry, Tier};
use crate::builder::HybridCacheBuilder;
use crate::bus::{
    BusTransport, InvalidationBus, InvalidationMessage, MessageDeduplicator, NotifyType,
    PublishStats, PublishSupervisor, SubscriptionHandle,
};
use crate::config::HybridCacheConfig;
use crate::error::{Error, Result};
use crate::observability::CacheMetrics;
use crate::serialization::{CacheCodec, PostcardCodec};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FENCE_STRIPES: usize = 64;

/// Key carried by `Cleared` messages.
const CLEARED_KEY: &str = "*";

/// Striped write epochs used to keep a slow Remote read from promoting a
/// value that a concurrent write or invalidation already superseded.
///
/// Keys hashing to the same stripe share an epoch; a collision only skips a
/// promotion, it never promotes stale data.
pub(crate) struct PromotionFence {
    epochs: Box<[AtomicU64]>,
}

impl PromotionFence {
    pub(crate) fn new() -> Self {
        PromotionFence {
            epochs: (0..FENCE_STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn stripe(&self, key: &str) -> &AtomicU64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.epochs[(hasher.finish() as usize) % self.epochs.len()]
    }

    pub(crate) fn epoch(&self, key: &str) -> u64 {
        self.stripe(key).load(Ordering::Acquire)
    }

    pub(crate) fn bump(&self, key: &str) {
        self.stripe(key).fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bump_all(&self) {
        for epoch in self.epochs.iter() {
            epoch.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Applies bus messages to the Local tier of one node.
pub(crate) struct LocalInvalidator<L: CacheBackend> {
    local: L,
    fence: Arc<PromotionFence>,
    dedup: MessageDeduplicator,
    metrics: Arc<dyn CacheMetrics>,
    node_id: String,
    ignore_own_messages: bool,
}

impl<L: CacheBackend> LocalInvalidator<L> {
    pub(crate) fn new(
        local: L,
        fence: Arc<PromotionFence>,
        metrics: Arc<dyn CacheMetrics>,
        config: &HybridCacheConfig,
    ) -> Self {
        LocalInvalidator {
            local,
            fence,
            dedup: MessageDeduplicator::new(config.dedup_window),
            metrics,
            node_id: config.node_id.clone(),
            ignore_own_messages: config.ignore_own_messages,
        }
    }

    pub(crate) async fn on_message(&self, message: InvalidationMessage) {
        if self.ignore_own_messages && message.origin_node_id == self.node_id {
            return;
        }
        if self.dedup.is_duplicate(&message.id) {
            debug!(
                "Duplicate invalidation {} for {} ignored",
                message.id, message.cache_key
            );
            return;
        }

        match message.notify_type {
            NotifyType::Updated | NotifyType::Removed => {
                self.fence.bump(&message.cache_key);
                if let Err(e) = self.local.remove(&message.cache_key).await {
                    warn!(
                        "⚠ Failed to evict {} from local tier: {}",
                        message.cache_key, e
                    );
                    return;
                }
                debug!(
                    "✓ Evicted {} from local tier ({} by {})",
                    message.cache_key, message.notify_type, message.origin_node_id
                );
            }
            NotifyType::Cleared => {
                self.fence.bump_all();
                if let Err(e) = self.local.clear_all().await {
                    warn!("⚠ Failed to clear local tier: {}", e);
                    return;
                }
                info!(
                    "✓ Local tier cleared (requested by {})",
                    message.origin_node_id
                );
            }
        }
        // Only an applied message counts as seen, so a redelivery retries
        // a failed eviction
        self.dedup.record(message.id);
        self.metrics
            .record_invalidation(&message.cache_key, message.notify_type);
    }
}

/// Evicts the key from Local if a write is dropped mid-flight.
///
/// Once the Remote write may have landed, the Local copy can no longer be
/// trusted; evicting it leaves "Remote has the write, Local does not".
struct EvictOnCancel<'a, L: CacheBackend + Clone> {
    local: &'a L,
    key: &'a str,
    armed: bool,
}

impl<'a, L: CacheBackend + Clone> EvictOnCancel<'a, L> {
    fn arm(local: &'a L, key: &'a str) -> Self {
        EvictOnCancel {
            local,
            key,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<L: CacheBackend + Clone> Drop for EvictOnCancel<'_, L> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let local = self.local.clone();
        let key = self.key.to_string();
        debug!("Write to {} cancelled, evicting local copy", key);
        runtime.spawn(async move {
            if let Err(e) = local.remove(&key).await {
                warn!("⚠ Failed to evict {} after cancelled write: {}", key, e);
            }
        });
    }
}

struct Shared<L, R, T, C>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
{
    local: L,
    remote: R,
    codec: C,
    config: HybridCacheConfig,
    metrics: Arc<dyn CacheMetrics>,
    fence: Arc<PromotionFence>,
    bus: Arc<InvalidationBus<T>>,
    publisher: PublishSupervisor,
    invalidator: Arc<LocalInvalidator<L>>,
    subscription: SubscriptionHandle,
}

/// Two-tier cache kept coherent across nodes by an invalidation bus.
///
/// Cloning is cheap; clones share tiers, bus subscription and publisher.
/// The subscription stops when the last clone is dropped.
///
/// # Example
///
/// ```ignore
/// let cache = HybridCache::builder(InMemoryBackend::new(), remote, transport)
///     .config(HybridCacheConfig::new("orders"))
///     .build()
///     .await?;
///
/// cache.set("order:1", &order, Duration::from_secs(60)).await?;
/// let order: Option<Order> = cache.get("order:1").await?;
/// ```
pub struct HybridCache<L, R, T, C = PostcardCodec>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
{
    shared: Arc<Shared<L, R, T, C>>,
}

impl<L, R, T, C> Clone for HybridCache<L, R, T, C>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
{
    fn clone(&self) -> Self {
        HybridCache {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L, R, T> HybridCache<L, R, T, PostcardCodec>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
{
    /// Start configuring a cache over the given tiers and bus transport.
    pub fn builder(local: L, remote: R, transport: T) -> HybridCacheBuilder<L, R, T> {
        HybridCacheBuilder::new(local, remote, transport)
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::ValidationError("cache key must not be empty".to_string()));
    }
    Ok(())
}

fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(Error::ValidationError(
            "TTL must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

impl<L, R, T, C> HybridCache<L, R, T, C>
where
    L: CacheBackend + Clone,
    R: CacheBackend,
    T: BusTransport,
    C: CacheCodec,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        local: L,
        remote: R,
        codec: C,
        config: HybridCacheConfig,
        metrics: Arc<dyn CacheMetrics>,
        fence: Arc<PromotionFence>,
        bus: Arc<InvalidationBus<T>>,
        publisher: PublishSupervisor,
        invalidator: Arc<LocalInvalidator<L>>,
        subscription: SubscriptionHandle,
    ) -> Self {
        HybridCache {
            shared: Arc::new(Shared {
                local,
                remote,
                codec,
                config,
                metrics,
                fence,
                bus,
                publisher,
                invalidator,
                subscription,
            }),
        }
    }

    /// Read `key`, consulting Local then Remote.
    ///
    /// A Remote hit is promoted into Local with its remaining TTL. Returns
    /// `Ok(None)` when neither tier holds a live entry.
    ///
    /// # Errors
    /// - `Error::ValidationError` for an empty key
    /// - `Error::DeserializationError`, `Error::InvalidCacheEntry` or
    ///   `Error::VersionMismatch` when stored bytes do not decode; corruption
    ///   is never reported as a miss
    /// - `Error::BackendError` / `Error::Timeout` from the Remote tier
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        validate_key(key)?;
        let timer = Instant::now();
        let shared = &*self.shared;

        match shared.local.get(key).await {
            Ok(Some(bytes)) => {
                let value = self.decode(key, Tier::Local, &bytes)?;
                debug!("✓ GET {} -> local HIT", key);
                shared.metrics.record_hit(key, Tier::Local, timer.elapsed());
                return Ok(Some(value));
            }
            Ok(None) => {}
            Err(e) => warn!("⚠ Local GET {} failed, reading remote: {}", key, e),
        }

        let epoch = shared.fence.epoch(key);
        let Some(entry) = self
            .remote_call("GET", key, shared.remote.get_entry(key))
            .await?
        else {
            debug!("✗ GET {} -> MISS", key);
            shared.metrics.record_miss(key, timer.elapsed());
            return Ok(None);
        };

        let value = self.decode(key, Tier::Remote, &entry.payload)?;
        debug!("✓ GET {} -> remote HIT", key);
        self.promote(key, entry, epoch).await;
        shared.metrics.record_hit(key, Tier::Remote, timer.elapsed());
        Ok(Some(value))
    }

    /// Read `key`; on a miss run `factory`, store its value in both tiers
    /// and return it.
    ///
    /// Concurrent misses may each run the factory; use
    /// [`CacheAside`](crate::CacheAside) with a lock to prevent that.
    ///
    /// # Errors
    /// Everything [`get`](Self::get) returns, the factory's own error
    /// unchanged, and `Error::SerializationError` if the computed value
    /// cannot be encoded. A failure to store the computed value is logged,
    /// not returned.
    pub async fn get_or_compute<V, F, Fut>(&self, key: &str, ttl: Duration, factory: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        validate_ttl(ttl)?;
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        debug!("Computing {} after cache miss", key);
        let value = factory().await?;
        self.store_computed(key, &value, ttl).await?;
        Ok(value)
    }

    /// Best-effort store of a freshly computed value: only encoding errors
    /// are returned.
    pub(crate) async fn store_computed<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        ttl: Duration,
    ) -> Result<()> {
        let payload = self.shared.codec.encode(value)?;
        match self.write_through(key, payload, ttl).await {
            Ok(()) => self.publish(NotifyType::Updated, key),
            Err(e) => warn!("⚠ Computed value for {} not cached: {}", key, e),
        }
        Ok(())
    }

    /// Write `value` to Remote, then Local, then announce it to peers.
    ///
    /// # Errors
    /// - `Error::ValidationError` for an empty key or a zero TTL
    /// - `Error::SerializationError` if the value cannot be encoded
    /// - `Error::BackendError` if the Remote write is rejected; Local is
    ///   left untouched in that case
    /// - `Error::Timeout` if Remote did not answer in time; the Local copy is
    ///   evicted and peers are told to do the same
    pub async fn set<V: Serialize>(&self, key: &str, value: &V, ttl: Duration) -> Result<()> {
        validate_key(key)?;
        validate_ttl(ttl)?;

        let payload = self.shared.codec.encode(value)?;
        self.write_through(key, payload, ttl).await?;
        self.publish(NotifyType::Updated, key);
        Ok(())
    }

    async fn write_through(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        let shared = &*self.shared;
        let guard = EvictOnCancel::arm(&shared.local, key);
        shared.fence.bump(key);

        if let Err(e) = self
            .remote_call("SET", key, shared.remote.set(key, payload.clone(), Some(ttl)))
            .await
        {
            if matches!(e, Error::Timeout(_)) {
                self.evict_unknown_outcome(key, NotifyType::Updated).await;
            }
            guard.disarm();
            return Err(e);
        }

        if let Err(e) = shared.local.set(key, payload, Some(ttl)).await {
            warn!("⚠ Local SET {} failed after remote write: {}", key, e);
            if let Err(e) = shared.local.remove(key).await {
                warn!("⚠ Failed to drop stale local copy of {}: {}", key, e);
            }
        }
        shared.fence.bump(key);
        guard.disarm();

        debug!("✓ SET {} (ttl: {:?})", key, ttl);
        Ok(())
    }

    /// Delete `key` from Remote, then Local, then announce it to peers.
    ///
    /// Removing a missing key succeeds.
    ///
    /// # Errors
    /// - `Error::ValidationError` for an empty key
    /// - `Error::BackendError` / `Error::Timeout` if the Remote delete fails;
    ///   after a timeout the Local copy is evicted anyway
    pub async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let shared = &*self.shared;
        let guard = EvictOnCancel::arm(&shared.local, key);
        shared.fence.bump(key);

        if let Err(e) = self
            .remote_call("DEL", key, shared.remote.remove(key))
            .await
        {
            if matches!(e, Error::Timeout(_)) {
                self.evict_unknown_outcome(key, NotifyType::Removed).await;
            }
            guard.disarm();
            return Err(e);
        }

        if let Err(e) = shared.local.remove(key).await {
            warn!("⚠ Local DEL {} failed after remote delete: {}", key, e);
        }
        guard.disarm();

        debug!("✓ DEL {}", key);
        self.publish(NotifyType::Removed, key);
        Ok(())
    }

    /// Whether either tier holds a live entry for `key`.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let shared = &*self.shared;

        match shared.local.exists(key).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => warn!("⚠ Local EXISTS {} failed, asking remote: {}", key, e),
        }
        self.remote_call("EXISTS", key, shared.remote.exists(key))
            .await
    }

    /// Flush the Remote tier, then the Local tier, and tell every peer to
    /// clear its Local tier.
    ///
    /// # Errors
    /// `Error::BackendError` / `Error::Timeout` if the Remote flush fails.
    pub async fn clear(&self) -> Result<()> {
        let shared = &*self.shared;
        self.remote_call("FLUSH", CLEARED_KEY, shared.remote.clear_all())
            .await?;

        shared.fence.bump_all();
        if let Err(e) = shared.local.clear_all().await {
            warn!("⚠ Local clear failed after remote flush: {}", e);
        }
        self.publish(NotifyType::Cleared, CLEARED_KEY);

        warn!("⚠ Hybrid cache on topic {} cleared", shared.bus.topic());
        Ok(())
    }

    /// Apply an invalidation message to this node's Local tier, exactly as
    /// if it had arrived on the bus.
    pub async fn apply_invalidation(&self, message: InvalidationMessage) {
        self.shared.invalidator.on_message(message).await;
    }

    /// Wait until every invalidation queued so far was handed to the bus.
    pub async fn flush_publishes(&self) -> Result<()> {
        self.shared.publisher.flush().await
    }

    pub fn publish_stats(&self) -> &PublishStats {
        self.shared.publisher.stats()
    }

    /// Whether the bus subscription is still delivering messages.
    pub fn is_subscribed(&self) -> bool {
        self.shared.subscription.is_active()
    }

    pub fn local(&self) -> &L {
        &self.shared.local
    }

    pub fn remote(&self) -> &R {
        &self.shared.remote
    }

    pub fn codec(&self) -> &C {
        &self.shared.codec
    }

    pub fn config(&self) -> &HybridCacheConfig {
        &self.shared.config
    }

    pub fn node_id(&self) -> &str {
        self.shared.bus.node_id()
    }

    pub fn topic(&self) -> &str {
        self.shared.bus.topic()
    }

    fn publish(&self, notify_type: NotifyType, key: &str) {
        let message = self.shared.bus.message(notify_type, key);
        if let Err(e) = self.shared.publisher.submit(message) {
            warn!("⚠ {} invalidation for {} not published: {}", notify_type, key, e);
        }
    }

    /// A timed-out Remote write may still have landed: drop the Local copy
    /// here and on every peer so nobody keeps serving the old value.
    async fn evict_unknown_outcome(&self, key: &str, notify_type: NotifyType) {
        let shared = &*self.shared;
        shared.fence.bump(key);
        if let Err(e) = shared.local.remove(key).await {
            warn!("⚠ Failed to evict {} after remote timeout: {}", key, e);
        }
        self.publish(notify_type, key);
    }

    /// Copy a Remote entry into Local unless the key was written or
    /// invalidated since `epoch` was read.
    async fn promote(&self, key: &str, entry: CacheEntry, epoch: u64) {
        let shared = &*self.shared;
        let ttl = match entry.remaining_ttl() {
            Some(remaining) if remaining.is_zero() => return,
            Some(remaining) => remaining,
            None => shared.config.default_ttl,
        };

        if shared.fence.epoch(key) != epoch {
            debug!("Skipping promotion of {}: written while reading remote", key);
            return;
        }
        if let Err(e) = shared.local.set(key, entry.payload, Some(ttl)).await {
            warn!("⚠ Failed to promote {} into local tier: {}", key, e);
            return;
        }
        if shared.fence.epoch(key) != epoch {
            // Invalidated while promoting
            if let Err(e) = shared.local.remove(key).await {
                warn!("⚠ Failed to drop superseded promotion of {}: {}", key, e);
            }
            return;
        }

        debug!("✓ Promoted {} into local tier (ttl: {:?})", key, ttl);
        shared.metrics.record_promotion(key);
    }

    fn decode<V: DeserializeOwned>(&self, key: &str, tier: Tier, bytes: &[u8]) -> Result<V> {
        self.shared.codec.decode(bytes).map_err(|e| {
            error!(
                "Corrupted {} entry for {} ({} codec): {}",
                tier,
                key,
                self.shared.codec.name(),
                e
            );
            self.shared.metrics.record_error(key, &e.to_string());
            e
        })
    }

    async fn remote_call<X>(
        &self,
        op: &str,
        key: &str,
        call: impl Future<Output = Result<X>>,
    ) -> Result<X> {
        let outcome = match self.shared.config.remote_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout(format!(
                    "remote {} {} exceeded {:?}",
                    op, key, limit
                ))),
            },
            None => call.await,
        };

        if let Err(e) = &outcome {
            warn!("⚠ Remote {} {} failed: {}", op, key, e);
            self.shared.metrics.record_error(key, &e.to_string());
        }
        outcome
    }
}
