//! Distributed lock used to serialize recomputation of a key across nodes.
//!
//! ```text
//!               lock() ok                 release()
//! Unacquired ─────────────► Held ────────────────────► Released
//!                             │
//!                             │ ttl elapsed / ownership lost
//!                             ▼
//!                          Expired
//! ```
//!
//! `Released` and `Expired` are terminal: create a new handle to try again.
//! The lease TTL stored with the lock is the safety net for holders that
//! crash without releasing.

use crate::config::LockConfig;
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[cfg(feature = "inmemory")]
mod memory;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "inmemory")]
pub use memory::InMemoryLockBackend;
#[cfg(feature = "redis")]
pub use redis::RedisLockBackend;

/// Store-side primitives a lock needs.
///
/// Implementations are cheap handles; clones talk to the same store.
pub trait LockBackend: Clone + Send + Sync + 'static {
    /// Atomically claim `key` for `token` unless someone else holds a live
    /// lease. The lease expires after `ttl`.
    fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Delete `key` only if it is still held by `token`. Returns whether a
    /// lease was deleted.
    fn release(&self, key: &str, token: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// Lifecycle of a [`LockHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unacquired,
    Held,
    Released,
    Expired,
}

/// One attempt at exclusive ownership of `(resource_name, lock_key)`.
///
/// Owned by a single caller. Dropping a handle that still holds its lease
/// schedules a best-effort release on the current runtime.
pub struct LockHandle<B: LockBackend> {
    backend: B,
    resource_name: String,
    lock_key: String,
    store_key: String,
    token: String,
    state: LockState,
    acquired_at: Option<Instant>,
    ttl: Duration,
    retry_initial: Duration,
    retry_max: Duration,
}

impl<B: LockBackend> LockHandle<B> {
    fn new(backend: B, config: &LockConfig, resource_name: &str, lock_key: &str) -> Self {
        LockHandle {
            backend,
            resource_name: resource_name.to_string(),
            lock_key: lock_key.to_string(),
            store_key: format!("{}:{}:{}", config.key_prefix, resource_name, lock_key),
            token: Uuid::now_v7().to_string(),
            state: LockState::Unacquired,
            acquired_at: None,
            ttl: config.ttl,
            retry_initial: config.retry_initial,
            retry_max: config.retry_max,
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Key the lease is stored under.
    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn acquired_at(&self) -> Option<Instant> {
        self.acquired_at
    }

    /// Current state. A held lease whose TTL has elapsed reports `Expired`.
    pub fn state(&self) -> LockState {
        match (self.state, self.acquired_at) {
            (LockState::Held, Some(at)) if at.elapsed() >= self.ttl => LockState::Expired,
            (state, _) => state,
        }
    }

    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Try to acquire the lock before `timeout_ms` elapses.
    ///
    /// Polls the backend with exponential backoff. Returns `Ok(false)` on
    /// timeout; backend failures are errors. Calling it on a held handle
    /// returns `Ok(true)` without I/O.
    ///
    /// # Errors
    /// - `Error::LockError` if the handle is already released or expired
    /// - any backend error
    pub async fn lock(&mut self, timeout_ms: u64) -> Result<bool> {
        match self.state() {
            LockState::Held => return Ok(true),
            LockState::Released | LockState::Expired => {
                return Err(Error::LockError(format!(
                    "lock {} is {:?}; create a new handle to acquire it again",
                    self.store_key,
                    self.state()
                )))
            }
            LockState::Unacquired => {}
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut backoff = self.retry_initial;

        loop {
            let attempt_started = Instant::now();
            let remaining = deadline.saturating_duration_since(attempt_started);
            let attempt = tokio::time::timeout(
                remaining,
                self.backend.try_acquire(&self.store_key, &self.token, self.ttl),
            )
            .await;
            let Ok(acquired) = attempt else {
                debug!(
                    "Lock {} attempt still pending after {}ms, giving up",
                    self.store_key, timeout_ms
                );
                self.abandon_attempt();
                return Ok(false);
            };
            if acquired? {
                self.state = LockState::Held;
                self.acquired_at = Some(attempt_started);
                debug!("✓ Lock {} acquired (ttl: {:?})", self.store_key, self.ttl);
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Lock {} not acquired within {}ms", self.store_key, timeout_ms);
                return Ok(false);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(self.retry_max);
        }
    }

    /// The abandoned attempt may still have been applied by the store; clear
    /// our token in the background so the lease does not linger until expiry.
    fn abandon_attempt(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = self.backend.clone();
        let key = self.store_key.clone();
        let token = self.token.clone();
        runtime.spawn(async move {
            if let Err(e) = backend.release(&key, &token).await {
                warn!("⚠ Failed to clear abandoned lock attempt on {}: {}", key, e);
            }
        });
    }

    /// Release the lock if this handle still owns it.
    ///
    /// A no-op for handles that never acquired, were already released, or
    /// whose lease was taken over after expiry.
    pub async fn release(&mut self) -> Result<()> {
        if self.state != LockState::Held {
            return Ok(());
        }

        if self.backend.release(&self.store_key, &self.token).await? {
            self.state = LockState::Released;
            debug!("✓ Lock {} released", self.store_key);
        } else {
            self.state = LockState::Expired;
            warn!(
                "⚠ Lock {} expired before release; another holder may own it",
                self.store_key
            );
        }
        Ok(())
    }
}

impl<B: LockBackend> Drop for LockHandle<B> {
    fn drop(&mut self) {
        if self.state() != LockState::Held {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "⚠ Lock {} dropped outside a runtime; lease will expire on its own",
                self.store_key
            );
            return;
        };

        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.store_key);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            if let Err(e) = backend.release(&key, &token).await {
                warn!("⚠ Failed to release dropped lock {}: {}", key, e);
            }
        });
    }
}

/// Creates lock handles bound to one backend and configuration.
#[derive(Clone)]
pub struct DistributedLockFactory<B: LockBackend> {
    backend: B,
    config: LockConfig,
}

impl<B: LockBackend> DistributedLockFactory<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, LockConfig::default())
    }

    pub fn with_config(backend: B, config: LockConfig) -> Self {
        DistributedLockFactory { backend, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Build an unacquired handle. No I/O.
    pub fn create_lock(&self, resource_name: &str, lock_key: &str) -> LockHandle<B> {
        LockHandle::new(self.backend.clone(), &self.config, resource_name, lock_key)
    }

    /// Run `f` while holding the lock.
    ///
    /// Returns `Ok(None)` if the lock could not be acquired in time. The lock
    /// is released whatever `f` returns; a panic inside `f` drops the handle,
    /// which schedules the release.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource_name: &str,
        lock_key: &str,
        timeout_ms: u64,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut lock = self.create_lock(resource_name, lock_key);
        if !lock.lock(timeout_ms).await? {
            return Ok(None);
        }

        let result = f().await;
        if let Err(e) = lock.release().await {
            warn!("⚠ Failed to release lock {}: {}", lock.store_key(), e);
        }
        result.map(Some)
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn factory(ttl: Duration) -> DistributedLockFactory<InMemoryLockBackend> {
        DistributedLockFactory::with_config(
            InMemoryLockBackend::new(),
            LockConfig::default()
                .with_ttl(ttl)
                .with_retry(Duration::from_millis(5), Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn test_create_lock_is_pure() {
        let factory = factory(Duration::from_secs(5));
        let lock = factory.create_lock("report", "2024-q1");

        assert_eq!(lock.state(), LockState::Unacquired);
        assert_eq!(lock.store_key(), "lock:report:2024-q1");
        assert_eq!(lock.resource_name(), "report");
        assert_eq!(lock.lock_key(), "2024-q1");
        assert!(lock.acquired_at().is_none());
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let factory = factory(Duration::from_secs(5));
        let mut lock = factory.create_lock("report", "q1");

        assert!(lock.lock(100).await.expect("lock"));
        assert!(lock.is_held());
        // Re-entrant call on the same handle
        assert!(lock.lock(100).await.expect("lock"));

        lock.release().await.expect("release");
        assert_eq!(lock.state(), LockState::Released);

        // Releasing twice is a no-op
        lock.release().await.expect("release");
        assert_eq!(lock.state(), LockState::Released);
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let factory = factory(Duration::from_secs(5));
        let mut winner = factory.create_lock("report", "q1");
        let mut loser = factory.create_lock("report", "q1");

        assert!(winner.lock(50).await.expect("lock"));
        assert!(!loser.lock(50).await.expect("lock"));
        assert_eq!(loser.state(), LockState::Unacquired);

        winner.release().await.expect("release");
        assert!(loser.lock(50).await.expect("lock"));
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let factory = factory(Duration::from_secs(5));
        let mut winner = factory.create_lock("report", "q1");
        assert!(winner.lock(10).await.expect("lock"));

        let waiter_factory = factory.clone();
        let waiter = tokio::spawn(async move {
            let mut lock = waiter_factory.create_lock("report", "q1");
            let acquired = lock.lock(2_000).await.expect("lock");
            lock.release().await.expect("release");
            acquired
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        winner.release().await.expect("release");

        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn test_auto_expiry() {
        let factory = factory(Duration::from_millis(50));
        let mut crashed = factory.create_lock("report", "q1");
        assert!(crashed.lock(10).await.expect("lock"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(crashed.state(), LockState::Expired);

        let mut next = factory.create_lock("report", "q1");
        assert!(next.lock(10).await.expect("lock"));

        // The stale holder must not release the new owner's lease
        crashed.release().await.expect("release");
        assert!(next.is_held());
        let mut third = factory.create_lock("report", "q1");
        assert!(!third.lock(10).await.expect("lock"));
    }

    #[tokio::test]
    async fn test_terminal_handle_cannot_relock() {
        let factory = factory(Duration::from_secs(5));
        let mut lock = factory.create_lock("report", "q1");
        assert!(lock.lock(10).await.expect("lock"));
        lock.release().await.expect("release");

        assert!(matches!(lock.lock(10).await, Err(Error::LockError(_))));
    }

    #[tokio::test]
    async fn test_release_unacquired_is_noop() {
        let factory = factory(Duration::from_secs(5));
        let mut lock = factory.create_lock("report", "q1");
        lock.release().await.expect("release");
        assert_eq!(lock.state(), LockState::Unacquired);
    }

    #[tokio::test]
    async fn test_drop_releases_lease() {
        let factory = factory(Duration::from_secs(30));
        {
            let mut lock = factory.create_lock("report", "q1");
            assert!(lock.lock(10).await.expect("lock"));
        }

        let mut next = factory.create_lock("report", "q1");
        assert!(next.lock(500).await.expect("lock"));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let factory = factory(Duration::from_secs(30));

        let result: Result<Option<()>> = factory
            .with_lock("report", "q1", 50, || async {
                Err(Error::BackendError("boom".to_string()))
            })
            .await;
        assert!(matches!(result, Err(Error::BackendError(_))));

        let value = factory
            .with_lock("report", "q1", 50, || async { Ok(7) })
            .await
            .expect("with_lock");
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn test_with_lock_serializes_critical_sections() {
        let factory = factory(Duration::from_secs(30));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let factory = factory.clone();
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                factory
                    .with_lock("report", "q1", 5_000, || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .expect("with_lock")
            }));
        }

        for task in tasks {
            assert_eq!(task.await.expect("join"), Some(()));
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    /// Backend whose acquire answers only after `delay`, then grants.
    #[derive(Clone)]
    struct SlowBackend {
        inner: InMemoryLockBackend,
        delay: Duration,
        releases: Arc<AtomicUsize>,
    }

    impl LockBackend for SlowBackend {
        async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            let granted = self.inner.try_acquire(key, token, ttl).await?;
            tokio::time::sleep(self.delay).await;
            Ok(granted)
        }

        async fn release(&self, key: &str, token: &str) -> Result<bool> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(key, token).await
        }
    }

    #[tokio::test]
    async fn test_slow_backend_does_not_overrun_deadline() {
        let backend = SlowBackend {
            inner: InMemoryLockBackend::new(),
            delay: Duration::from_millis(500),
            releases: Arc::new(AtomicUsize::new(0)),
        };
        let factory = DistributedLockFactory::new(backend.clone());
        let mut lock = factory.create_lock("report", "slow");

        let started = Instant::now();
        assert!(!lock.lock(50).await.expect("lock"));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(lock.state(), LockState::Unacquired);

        // The abandoned attempt's lease is cleared in the background
        for _ in 0..100 {
            if backend.inner.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(backend.inner.is_empty());
        assert!(backend.releases.load(Ordering::SeqCst) >= 1);
    }
}
