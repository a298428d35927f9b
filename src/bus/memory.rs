//! In-process bus transport on tokio broadcast channels.

use super::{BusTransport, MessageHandler, SubscriptionHandle};
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

const DEFAULT_CAPACITY: usize = 1024;

/// Transport connecting coordinators that live in the same process.
///
/// Clones share the same channels. Useful for tests and for several cache
/// instances inside one service. A subscriber that falls more than
/// `capacity` messages behind loses the oldest ones; the TTL bounds the
/// resulting staleness.
#[derive(Clone)]
pub struct InMemoryTransport {
    channels: Arc<DashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        InMemoryTransport {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .value()
            .clone()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl BusTransport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        // No receivers is not a failure: nobody needs to evict anything.
        let delivered = self.sender(topic).send(payload).unwrap_or(0);
        debug!("InMemory PUBLISH {} -> {} subscriber(s)", topic, delivered);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionHandle> {
        let mut rx = self.sender(topic).subscribe();
        let name = topic.to_string();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => handler(payload).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "⚠ Subscriber on {} lagged, {} invalidation(s) lost",
                            name, skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(SubscriptionHandle::new(topic, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        Arc::new(move |_payload: Vec<u8>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let transport = InMemoryTransport::new();
        transport
            .publish("nobody", b"x".to_vec())
            .await
            .expect("Failed to publish");
        assert_eq!(transport.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let transport = InMemoryTransport::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let _a = transport
            .subscribe("t", counting_handler(Arc::clone(&first)))
            .await
            .expect("subscribe");
        let _b = transport
            .subscribe("t", counting_handler(Arc::clone(&second)))
            .await
            .expect("subscribe");
        assert_eq!(transport.subscriber_count("t"), 2);

        transport.publish("t", b"1".to_vec()).await.expect("publish");
        transport.publish("t", b"2".to_vec()).await.expect("publish");

        for _ in 0..100 {
            if first.load(Ordering::SeqCst) == 2 && second.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let transport = InMemoryTransport::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _handle = transport
            .subscribe("orders", counting_handler(Arc::clone(&counter)))
            .await
            .expect("subscribe");

        transport.publish("users", b"x".to_vec()).await.expect("publish");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
