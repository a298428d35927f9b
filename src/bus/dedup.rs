//! Duplicate suppression for at-least-once delivery.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Prune once the map grows past this many ids.
const PRUNE_THRESHOLD: usize = 4096;

/// Upper bound on how often a full prune scan runs.
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Remembers recently applied message ids for a bounded window.
///
/// Eviction is idempotent, so this is an optimisation only: a duplicate that
/// slips through after the window has passed evicts an already-evicted key.
pub struct MessageDeduplicator {
    seen: DashMap<Uuid, Instant>,
    window: Duration,
    prune_interval: Duration,
    started: Instant,
    /// Milliseconds after `started` of the last prune scan.
    last_prune_ms: AtomicU64,
    prunes: AtomicU64,
}

impl MessageDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self::with_prune_interval(window, window.min(PRUNE_INTERVAL))
    }

    pub(crate) fn with_prune_interval(window: Duration, prune_interval: Duration) -> Self {
        MessageDeduplicator {
            seen: DashMap::new(),
            window,
            prune_interval,
            started: Instant::now(),
            last_prune_ms: AtomicU64::new(0),
            prunes: AtomicU64::new(0),
        }
    }

    /// Whether `id` was already recorded inside the window.
    pub fn is_duplicate(&self, id: &Uuid) -> bool {
        self.seen
            .get(id)
            .map(|seen_at| seen_at.elapsed() < self.window)
            .unwrap_or(false)
    }

    /// Remember `id` as applied now.
    pub fn record(&self, id: Uuid) {
        let now = Instant::now();
        self.maybe_prune(now);
        self.seen.insert(id, now);
    }

    /// Record `id` and report whether this is its first delivery inside the
    /// window.
    pub fn first_delivery(&self, id: Uuid) -> bool {
        let now = Instant::now();
        self.maybe_prune(now);

        let mut first = true;
        self.seen
            .entry(id)
            .and_modify(|seen_at| {
                if now.duration_since(*seen_at) < self.window {
                    first = false;
                } else {
                    *seen_at = now;
                }
            })
            .or_insert(now);
        first
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Number of prune scans run so far.
    pub fn prunes(&self) -> u64 {
        self.prunes.load(Ordering::Relaxed)
    }

    /// Scan out expired ids, at most once per prune interval.
    fn maybe_prune(&self, now: Instant) {
        if self.seen.len() <= PRUNE_THRESHOLD {
            return;
        }
        let now_ms = now.duration_since(self.started).as_millis() as u64;
        let last = self.last_prune_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.prune_interval.as_millis() as u64 {
            return;
        }
        // One caller wins the scan; the rest carry on
        if self
            .last_prune_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < window);
        self.prunes.fetch_add(1, Ordering::Relaxed);
    }
}
