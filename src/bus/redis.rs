//! Redis Pub/Sub bus transport for cross-node invalidation.
//!
//! ```text
//! Node 1: PUBLISH <topic> <CKIM envelope>
//!   ↓
//! Node 2: subscription task receives payload → evicts key from local tier
//! Node 3: subscription task receives payload → evicts key from local tier
//! ```
//!
//! Publishing goes through the shared connection pool; each subscription
//! holds a dedicated pub/sub connection (pooled connections cannot
//! SUBSCRIBE) and reconnects with exponential backoff when it drops.
//! Messages published while a subscriber is reconnecting are lost; entry TTLs
//! bound the staleness this can cause.

use super::{BusTransport, MessageHandler, SubscriptionHandle};
use crate::backend::RedisConfig;
use crate::error::{Error, Result};
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use futures::StreamExt;
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Bus transport on Redis PUBLISH/SUBSCRIBE.
#[derive(Clone)]
pub struct RedisTransport {
    pool: Pool,
    redis_url: String,
}

impl RedisTransport {
    /// # Errors
    /// Returns `Error::ConfigError` if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        Ok(RedisTransport {
            pool: config.create_pool()?,
            redis_url: config.url.clone(),
        })
    }

    /// Reuse a pool shared with the Redis tier.
    pub fn from_pool(pool: Pool, redis_url: impl Into<String>) -> Self {
        RedisTransport {
            pool,
            redis_url: redis_url.into(),
        }
    }
}

/// Run one subscription session. Returns `Ok` when an established
/// connection closes, `Err` when it could not be established.
async fn run_session(redis_url: &str, topic: &str, handler: &MessageHandler) -> Result<()> {
    let client = ::redis::Client::open(redis_url)
        .map_err(|e| Error::BusError(format!("failed to create Redis client: {}", e)))?;

    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| Error::BusError(format!("failed to get pub/sub connection: {}", e)))?;

    pubsub
        .subscribe(topic)
        .await
        .map_err(|e| Error::BusError(format!("failed to subscribe to {}: {}", topic, e)))?;

    info!("✓ Subscribed to Redis channel {}", topic);

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        match msg.get_payload::<Vec<u8>>() {
            Ok(payload) => handler(payload).await,
            Err(e) => warn!("Failed to read pub/sub payload on {}: {}", topic, e),
        }
    }

    warn!("⚠ Redis pub/sub connection for {} closed", topic);
    Ok(())
}

impl BusTransport for RedisTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::BusError(format!("Failed to get Redis connection: {}", e)))?;

        let receivers: i64 = cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::BusError(format!("Redis PUBLISH to {} failed: {}", topic, e)))?;

        debug!("✓ Redis PUBLISH {} -> {} receiver(s)", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionHandle> {
        let redis_url = self.redis_url.clone();
        let channel = topic.to_string();

        let task = tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                match run_session(&redis_url, &channel, &handler).await {
                    Ok(()) => {
                        backoff = INITIAL_BACKOFF;
                        tokio::time::sleep(backoff).await;
                    }
                    Err(e) => {
                        error!(
                            "Invalidation subscription on {} failed: {}; reconnecting in {:?}",
                            channel, e, backoff
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(topic, task))
    }
}
