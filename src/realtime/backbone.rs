//! Cross-instance pub/sub backbone.

use std::sync::atomic::{AtomicBool, Ordering};

use ::redis::AsyncCommands;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::store::{RedisStore, StoreError};

/// Who an envelope is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Group { tenant_id: String, topic: String },
    User { tenant_id: String, user_id: String },
}

/// One fan-out published to every instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Instance that published it.
    pub origin: Uuid,
    pub target: Target,
    pub event: String,
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum BackboneError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("envelope encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("backbone unavailable")]
    Unavailable,
}

#[async_trait]
pub trait Backbone: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, envelope: &Envelope) -> Result<(), BackboneError>;

    /// Stream of envelopes from every instance, including this one.
    /// The stream ends when the subscription is lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, Envelope>, BackboneError>;
}

/// Redis PUBLISH/SUBSCRIBE on a single channel.
pub struct RedisBackbone {
    store: RedisStore,
    channel: String,
}

impl RedisBackbone {
    pub fn new(store: RedisStore, channel: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Backbone for RedisBackbone {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), BackboneError> {
        let body = serde_json::to_string(envelope)?;
        let channel = self.channel.clone();
        self.store
            .run(|mut conn| async move {
                let _receivers: u64 = conn.publish(channel, body).await?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Envelope>, BackboneError> {
        let mut pubsub = tokio::time::timeout(self.store.op_timeout(), self.store.client().get_async_pubsub())
            .await
            .map_err(|_| StoreError::Timeout)??;
        pubsub.subscribe(&self.channel).await?;
        tracing::info!(channel = %self.channel, "Subscribed to fan-out backbone");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let body: String = match msg.get_payload() {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable backbone message");
                    return None;
                }
            };
            match serde_json::from_str::<Envelope>(&body) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed backbone envelope");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// In-process backbone. Clones share one bus, which lets several hubs in
/// one process behave like separate instances.
#[derive(Clone)]
pub struct MemoryBackbone {
    tx: broadcast::Sender<Envelope>,
    available: std::sync::Arc<AtomicBool>,
}

impl MemoryBackbone {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            available: std::sync::Arc::new(AtomicBool::new(true)),
        }
    }

    /// Number of live subscriptions.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Simulate an outage; publishes and new subscriptions fail while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl Default for MemoryBackbone {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), BackboneError> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(BackboneError::Unavailable);
        }
        // no subscribers is not an error
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Envelope>, BackboneError> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(BackboneError::Unavailable);
        }
        let rx = self.tx.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => return Some((envelope, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Backbone subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
