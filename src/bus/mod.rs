//! Invalidation bus: publish/subscribe of cache mutation events.
//!
//! ```text
//! Node A: set("k")  ──► PUBLISH <topic> {id, Updated, "k", origin: A}
//!                          │
//!          ┌───────────────┴───────────────┐
//!          ▼                               ▼
//!  Node B: evict "k" from local    Node C: evict "k" from local
//! ```
//!
//! Delivery is at-least-once with no cross-node ordering. Receivers always
//! *evict* and never overwrite, so any interleaving of messages converges to
//! "the local copy is no longer trusted" and the next read refetches from the
//! shared tier.

use crate::error::{Error, Result};
use crate::serialization::{decode_message, encode_message};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

mod dedup;
#[cfg(feature = "inmemory")]
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod supervisor;

pub use dedup::MessageDeduplicator;
#[cfg(feature = "inmemory")]
pub use memory::InMemoryTransport;
#[cfg(feature = "redis")]
pub use redis::RedisTransport;
pub use supervisor::{PublishStats, PublishSupervisor};

/// Kind of mutation a message announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotifyType {
    /// The key was written; peers drop their local copy.
    Updated,
    /// The key was deleted; peers drop their local copy.
    Removed,
    /// The whole shared tier was flushed; peers clear their local tier.
    Cleared,
}

impl std::fmt::Display for NotifyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyType::Updated => write!(f, "updated"),
            NotifyType::Removed => write!(f, "removed"),
            NotifyType::Cleared => write!(f, "cleared"),
        }
    }
}

/// Unit carried by the bus. Immutable once published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// Time-ordered id (UUIDv7), used for duplicate suppression.
    pub id: Uuid,
    pub topic: String,
    pub notify_type: NotifyType,
    pub cache_key: String,
    pub origin_node_id: String,
}

impl InvalidationMessage {
    pub fn new(
        topic: impl Into<String>,
        origin_node_id: impl Into<String>,
        notify_type: NotifyType,
        cache_key: impl Into<String>,
    ) -> Self {
        InvalidationMessage {
            id: Uuid::now_v7(),
            topic: topic.into(),
            notify_type,
            cache_key: cache_key.into(),
            origin_node_id: origin_node_id.into(),
        }
    }
}

/// Raw payload callback registered with a transport.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Transport carrying encoded messages between nodes.
pub trait BusTransport: Send + Sync + 'static {
    /// Hand `payload` to the transport. Resolves once the transport accepted
    /// it, not once peers received it.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Run `handler` once per payload received on `topic` until the returned
    /// handle is dropped or cancelled.
    fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> impl Future<Output = Result<SubscriptionHandle>> + Send;
}

/// Live subscription. Dropping it stops message delivery.
#[derive(Debug)]
pub struct SubscriptionHandle {
    topic: String,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(topic: impl Into<String>, task: JoinHandle<()>) -> Self {
        SubscriptionHandle {
            topic: topic.into(),
            task,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop receiving messages.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Typed view of a transport bound to one topic and one node identity.
pub struct InvalidationBus<T: BusTransport> {
    transport: T,
    topic: String,
    node_id: String,
}

impl<T: BusTransport> InvalidationBus<T> {
    pub fn new(transport: T, topic: impl Into<String>, node_id: impl Into<String>) -> Self {
        InvalidationBus {
            transport,
            topic: topic.into(),
            node_id: node_id.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Build a message originating from this node on this bus's topic.
    pub fn message(&self, notify_type: NotifyType, cache_key: &str) -> InvalidationMessage {
        InvalidationMessage::new(&self.topic, &self.node_id, notify_type, cache_key)
    }

    /// Encode and publish a message.
    ///
    /// # Errors
    /// - `Error::ValidationError` if the message targets another topic
    /// - `Error::BusError` when the transport rejects it
    pub async fn publish(&self, message: &InvalidationMessage) -> Result<()> {
        if message.topic != self.topic {
            return Err(Error::ValidationError(format!(
                "message for topic '{}' published on bus '{}'",
                message.topic, self.topic
            )));
        }
        let payload = encode_message(message)?;
        self.transport.publish(&self.topic, payload).await?;
        debug!(
            "✓ Published {} for {} on {} (id: {})",
            message.notify_type, message.cache_key, self.topic, message.id
        );
        Ok(())
    }

    /// Subscribe `on_message` to this bus's topic.
    ///
    /// Payloads are decoded here; malformed envelopes and messages for another
    /// topic are logged and dropped without reaching `on_message`.
    pub async fn subscribe<H, Fut>(&self, on_message: H) -> Result<SubscriptionHandle>
    where
        H: Fn(InvalidationMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let topic = self.topic.clone();
        let on_message = Arc::new(on_message);
        let handler: MessageHandler = Arc::new(move |payload: Vec<u8>| {
            let topic = topic.clone();
            let on_message = Arc::clone(&on_message);
            async move {
                match decode_message(&payload) {
                    Ok(message) if message.topic == topic => on_message(message).await,
                    Ok(message) => {
                        debug!(
                            "Ignoring message for topic {} received on {}",
                            message.topic, topic
                        );
                    }
                    Err(e) => warn!("Dropping malformed invalidation message on {}: {}", topic, e),
                }
            }
            .boxed()
        });

        let handle = self.transport.subscribe(&self.topic, handler).await?;
        info!(
            "✓ Node {} subscribed to invalidation topic {}",
            self.node_id, self.topic
        );
        Ok(handle)
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let transport = InMemoryTransport::new();
        let publisher = InvalidationBus::new(transport.clone(), "orders", "node-a");
        let subscriber = InvalidationBus::new(transport, "orders", "node-b");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _handle = subscriber
            .subscribe(move |message| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().expect("Failed to lock").push(message);
                }
            })
            .await
            .expect("Failed to subscribe");

        let message = publisher.message(NotifyType::Updated, "order:1");
        publisher.publish(&message).await.expect("Failed to publish");

        assert!(wait_for(|| received.lock().expect("lock").len() == 1).await);
        let got = received.lock().expect("lock")[0].clone();
        assert_eq!(got, message);
        assert_eq!(got.origin_node_id, "node-a");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let transport = InMemoryTransport::new();
        let bus = InvalidationBus::new(transport.clone(), "orders", "node-b");

        let received = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&received);
        let _handle = bus
            .subscribe(move |_| {
                let sink = Arc::clone(&sink);
                async move {
                    *sink.lock().expect("lock") += 1;
                }
            })
            .await
            .expect("Failed to subscribe");

        transport
            .publish("orders", b"garbage".to_vec())
            .await
            .expect("publish");
        let valid = bus.message(NotifyType::Removed, "order:2");
        bus.publish(&valid).await.expect("publish");

        assert!(wait_for(|| *received.lock().expect("lock") == 1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*received.lock().expect("lock"), 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_foreign_topic() {
        let bus = InvalidationBus::new(InMemoryTransport::new(), "orders", "node-a");
        let message = InvalidationMessage::new("users", "node-a", NotifyType::Updated, "u:1");

        assert!(matches!(
            bus.publish(&message).await,
            Err(Error::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_delivery() {
        let transport = InMemoryTransport::new();
        let bus = InvalidationBus::new(transport, "orders", "node-a");

        let handle = bus
            .subscribe(|_| async {})
            .await
            .expect("Failed to subscribe");
        assert!(handle.is_active());
        assert_eq!(handle.topic(), "orders");

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_active());
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = InvalidationMessage::new("t", "n", NotifyType::Updated, "k");
        let b = InvalidationMessage::new("t", "n", NotifyType::Updated, "k");
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.get_version_num(), 7);
    }
}
