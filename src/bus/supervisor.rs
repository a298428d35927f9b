//! Background publisher for invalidation messages.
//!
//! Write paths must not wait on the bus, and a failed publish must not fail
//! the write. Messages are queued to one task per coordinator that publishes
//! them in submission order, logs failures (including panics inside the
//! transport) and keeps counters.

use super::{BusTransport, InvalidationBus, InvalidationMessage};
use crate::error::{Error, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Counters kept by a [`PublishSupervisor`].
#[derive(Debug, Default)]
pub struct PublishStats {
    published: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl PublishStats {
    /// Messages accepted by the transport.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Messages the transport rejected (or panicked on).
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Messages discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum Command {
    Publish(InvalidationMessage),
    Flush(oneshot::Sender<()>),
}

/// Owns the publishing task for one bus.
///
/// The task stops once every `PublishSupervisor` handle is dropped and the
/// queue is drained.
pub struct PublishSupervisor {
    tx: mpsc::Sender<Command>,
    stats: Arc<PublishStats>,
    task: JoinHandle<()>,
}

impl PublishSupervisor {
    /// Spawn the publishing task. Must be called inside a tokio runtime.
    pub fn spawn<T: BusTransport>(bus: Arc<InvalidationBus<T>>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(PublishStats::default());
        let counters = Arc::clone(&stats);

        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Publish(message) => {
                        let outcome = AssertUnwindSafe(bus.publish(&message))
                            .catch_unwind()
                            .await;
                        match outcome {
                            Ok(Ok(())) => {
                                counters.published.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(Err(e)) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    "⚠ Failed to publish {} for {} on {}: {}",
                                    message.notify_type,
                                    message.cache_key,
                                    bus.topic(),
                                    e
                                );
                            }
                            Err(_) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                error!(
                                    "Bus transport panicked publishing {} for {}",
                                    message.notify_type, message.cache_key
                                );
                            }
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Publish supervisor for {} stopped", bus.topic());
        });

        PublishSupervisor { tx, stats, task }
    }

    /// Queue `message` without waiting.
    ///
    /// # Errors
    /// Returns `Error::BusError` if the queue is full (the message is dropped)
    /// or the publishing task is gone.
    pub fn submit(&self, message: InvalidationMessage) -> Result<()> {
        match self.tx.try_send(Command::Publish(message)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::BusError("publish queue is full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::BusError("publish supervisor stopped".to_string()))
            }
        }
    }

    /// Wait until every message queued before this call was handed to the
    /// transport (or failed).
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Flush(done))
            .await
            .map_err(|_| Error::BusError("publish supervisor stopped".to_string()))?;
        wait.await
            .map_err(|_| Error::BusError("publish supervisor stopped".to_string()))
    }

    pub fn stats(&self) -> &PublishStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::bus::{InMemoryTransport, MessageHandler, NotifyType, SubscriptionHandle};
    use std::sync::atomic::AtomicBool;

    /// Transport that fails every publish while `down` is set.
    #[derive(Clone, Default)]
    struct FlakyTransport {
        down: Arc<AtomicBool>,
        inner: InMemoryTransport,
    }

    impl BusTransport for FlakyTransport {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::BusError("connection refused".to_string()));
            }
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(
            &self,
            topic: &str,
            handler: MessageHandler,
        ) -> Result<SubscriptionHandle> {
            self.inner.subscribe(topic, handler).await
        }
    }

    #[tokio::test]
    async fn test_publishes_and_counts() {
        let bus = Arc::new(InvalidationBus::new(InMemoryTransport::new(), "t", "node-a"));
        let supervisor = PublishSupervisor::spawn(Arc::clone(&bus), 16);

        supervisor
            .submit(bus.message(NotifyType::Updated, "k1"))
            .expect("submit");
        supervisor
            .submit(bus.message(NotifyType::Removed, "k2"))
            .expect("submit");
        supervisor.flush().await.expect("flush");

        assert_eq!(supervisor.stats().published(), 2);
        assert_eq!(supervisor.stats().failed(), 0);
        assert!(supervisor.is_running());
    }

    #[tokio::test]
    async fn test_failures_are_logged_not_fatal() {
        let transport = FlakyTransport::default();
        transport.down.store(true, Ordering::SeqCst);
        let bus = Arc::new(InvalidationBus::new(transport.clone(), "t", "node-a"));
        let supervisor = PublishSupervisor::spawn(Arc::clone(&bus), 16);

        supervisor
            .submit(bus.message(NotifyType::Updated, "k"))
            .expect("submit");
        supervisor.flush().await.expect("flush");
        assert_eq!(supervisor.stats().failed(), 1);

        // Supervisor keeps going once the transport recovers
        transport.down.store(false, Ordering::SeqCst);
        supervisor
            .submit(bus.message(NotifyType::Updated, "k"))
            .expect("submit");
        supervisor.flush().await.expect("flush");
        assert_eq!(supervisor.stats().published(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let bus = Arc::new(InvalidationBus::new(InMemoryTransport::new(), "t", "node-a"));
        let supervisor = PublishSupervisor::spawn(Arc::clone(&bus), 1);

        // current_thread runtime: the task cannot drain until we yield
        supervisor
            .submit(bus.message(NotifyType::Updated, "a"))
            .expect("submit");
        let second = supervisor.submit(bus.message(NotifyType::Updated, "b"));

        assert!(matches!(second, Err(Error::BusError(_))));
        assert_eq!(supervisor.stats().dropped(), 1);
    }
}
