//! # hybrid-cache-kit
//!
//! Two-tier caching for services running on several nodes: a fast local
//! tier in each process, a shared remote tier, and an invalidation bus that
//! keeps every local tier coherent with the shared one.
//!
//! ## Features
//!
//! - **Two tiers:** Local (in-process) and Remote (Redis, Memcached or any
//!   [`CacheBackend`]), with read-through promotion that keeps the remaining TTL
//! - **Invalidation bus:** writes publish `Updated`/`Removed` events; peers
//!   evict their local copy, so delivery order never matters
//! - **Distributed lock:** lease-based mutual exclusion for stampede-free
//!   recomputation
//! - **Cache-aside:** `get_or_compute`, strategies, retries and a method
//!   decorator
//! - **Backend agnostic:** tiers, bus transports, lock stores and codecs are
//!   traits; in-memory implementations ship by default
//!
//! ## Quick Start
//!
//! ```ignore
//! use hybrid_cache_kit::{
//!     backend::InMemoryBackend, bus::InMemoryTransport, HybridCache, HybridCacheConfig,
//! };
//! use std::time::Duration;
//!
//! let transport = InMemoryTransport::new();
//! let remote = InMemoryBackend::new();
//!
//! let cache = HybridCache::builder(InMemoryBackend::new(), remote, transport)
//!     .config(HybridCacheConfig::new("orders"))
//!     .build()
//!     .await?;
//!
//! cache.set("demo", &"123".to_string(), Duration::from_secs(60)).await?;
//! let value: Option<String> = cache.get("demo").await?;
//!
//! let computed: String = cache
//!     .get_or_compute("other", Duration::from_secs(60), || async { Ok("456".to_string()) })
//!     .await?;
//! ```
//!
//! ## Consistency
//!
//! Writes go to the Remote tier first; once `set` returns, any node reading
//! Remote sees the value. Other nodes' Local tiers converge asynchronously
//! when the bus message arrives, and the TTL bounds staleness if it never
//! does.

#[macro_use]
extern crate log;

pub mod aside;
pub mod backend;
pub mod blocking;
pub mod builder;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod lock;
pub mod observability;
pub mod registry;
pub mod serialization;
pub mod strategy;

// Re-exports for convenience
pub use aside::{CacheAside, CachedMethod, NoLock};
pub use backend::{CacheBackend, CacheEntry, Tier};
pub use blocking::BlockingHybridCache;
pub use builder::{CacheOperationBuilder, HybridCacheBuilder};
pub use bus::{BusTransport, InvalidationBus, InvalidationMessage, NotifyType};
pub use config::{HybridCacheConfig, LockConfig};
pub use coordinator::HybridCache;
pub use error::{Error, Result};
pub use key::CacheKeyBuilder;
pub use lock::{DistributedLockFactory, LockBackend, LockHandle, LockState};
pub use observability::{CacheMetrics, NoOpMetrics, TtlPolicy};
pub use registry::ProviderRegistry;
pub use serialization::{CacheCodec, JsonCodec, PostcardCodec};
pub use strategy::CacheStrategy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
