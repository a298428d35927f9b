//! Metrics hooks and TTL policies.

use crate::backend::Tier;
use crate::bus::NotifyType;
use std::time::Duration;

/// Receives cache events. Every method defaults to a no-op so
/// implementations only override what they export.
pub trait CacheMetrics: Send + Sync {
    /// Value served by `tier`.
    fn record_hit(&self, _key: &str, _tier: Tier, _duration: Duration) {}

    /// Neither tier held the key.
    fn record_miss(&self, _key: &str, _duration: Duration) {}

    /// Remote value copied into the Local tier.
    fn record_promotion(&self, _key: &str) {}

    /// Bus message applied to the Local tier.
    fn record_invalidation(&self, _key: &str, _notify_type: NotifyType) {}

    fn record_error(&self, _key: &str, _error: &str) {}
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {}

/// How cache-aside writes choose a TTL from a key prefix.
#[derive(Clone, Debug, Default)]
pub enum TtlPolicy {
    /// Use the coordinator's default TTL.
    #[default]
    Default,
    /// Same TTL for every key.
    Fixed(Duration),
    /// TTL chosen from the key prefix.
    PerType(fn(&str) -> Duration),
}

impl TtlPolicy {
    /// TTL for keys under `prefix`; `None` defers to the coordinator default.
    pub fn get_ttl(&self, prefix: &str) -> Option<Duration> {
        match self {
            TtlPolicy::Default => None,
            TtlPolicy::Fixed(ttl) => Some(*ttl),
            TtlPolicy::PerType(ttl_for) => Some(ttl_for(prefix)),
        }
    }
}
