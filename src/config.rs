//! Coordinator and lock configuration.

use crate::error::{Error, Result};
use std::time::Duration;
use uuid::Uuid;

/// Default TTL for promoted entries that carry no expiry of their own.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default capacity of the background publish queue.
/// Override with HYBRID_CACHE_PUBLISH_QUEUE environment variable
const DEFAULT_PUBLISH_QUEUE: usize = 1024;

const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Settings for one [`HybridCache`](crate::HybridCache) instance.
#[derive(Clone, Debug)]
pub struct HybridCacheConfig {
    /// Bus topic shared by every node of one application.
    pub topic: String,
    /// Identity stamped on published messages.
    pub node_id: String,
    /// TTL used when promoting a Remote entry that has no expiry, and when
    /// `get_or_compute` is called without a TTL.
    pub default_ttl: Duration,
    /// Deadline for each Remote operation. `None` waits indefinitely.
    pub remote_timeout: Option<Duration>,
    /// Skip bus messages published by this node.
    pub ignore_own_messages: bool,
    pub publish_queue_capacity: usize,
    /// How long message ids are remembered for duplicate suppression.
    pub dedup_window: Duration,
}

impl Default for HybridCacheConfig {
    fn default() -> Self {
        HybridCacheConfig {
            topic: "hybrid-cache".to_string(),
            node_id: format!("node-{}", Uuid::now_v7().simple()),
            default_ttl: DEFAULT_TTL,
            remote_timeout: None,
            ignore_own_messages: true,
            publish_queue_capacity: DEFAULT_PUBLISH_QUEUE,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl HybridCacheConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        HybridCacheConfig {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `HYBRID_CACHE_*` environment variables.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = HybridCacheConfig::default();
        if let Ok(topic) = std::env::var("HYBRID_CACHE_TOPIC") {
            config.topic = topic;
        }
        if let Ok(node_id) = std::env::var("HYBRID_CACHE_NODE_ID") {
            config.node_id = node_id;
        }
        if let Some(secs) = env_number("HYBRID_CACHE_DEFAULT_TTL_SECS")? {
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = env_number("HYBRID_CACHE_REMOTE_TIMEOUT_MS")? {
            config.remote_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(capacity) = env_number("HYBRID_CACHE_PUBLISH_QUEUE")? {
            config.publish_queue_capacity = capacity as usize;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = Some(timeout);
        self
    }

    pub fn with_ignore_own_messages(mut self, ignore: bool) -> Self {
        self.ignore_own_messages = ignore;
        self
    }

    pub fn with_publish_queue_capacity(mut self, capacity: usize) -> Self {
        self.publish_queue_capacity = capacity;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// # Errors
    /// Returns `Error::ConfigError` for an empty topic or node id, a zero
    /// default TTL or a zero publish queue.
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::ConfigError("topic must not be empty".to_string()));
        }
        if self.node_id.is_empty() {
            return Err(Error::ConfigError("node id must not be empty".to_string()));
        }
        if self.default_ttl.is_zero() {
            return Err(Error::ConfigError(
                "default TTL must be greater than zero".to_string(),
            ));
        }
        if self.publish_queue_capacity == 0 {
            return Err(Error::ConfigError(
                "publish queue capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::ConfigError(format!("{} = {:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Settings shared by every handle a lock factory creates.
#[derive(Clone, Debug)]
pub struct LockConfig {
    /// Lease lifetime in the store; a crashed holder frees the lock after it.
    pub ttl: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            ttl: Duration::from_secs(30),
            retry_initial: Duration::from_millis(10),
            retry_max: Duration::from_millis(200),
            key_prefix: "lock".to_string(),
        }
    }
}

impl LockConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Polling backoff: starts at `initial`, doubles up to `max`.
    pub fn with_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial.max(Duration::from_millis(1));
        self.retry_max = max.max(self.retry_initial);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}
