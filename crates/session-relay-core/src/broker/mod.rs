//! Publish/subscribe broker abstraction.
//!
//! Delivery is at-most-once: a payload published to a topic with no
//! subscriber is dropped, and nothing is buffered while the broker is
//! unreachable. Each [`Subscription`] feeds an ordered channel so a
//! single consumer sees messages in the order the broker delivered them.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Broker error.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
    #[error("Broker error: {0}")]
    Internal(String),
}

/// Trait for publish/subscribe backends shared by every session in a process.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload. Returns how many subscribers received it.
    ///
    /// # Errors
    /// Returns [`BrokerError::Unavailable`] if the broker connection is down.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BrokerError>;

    /// Subscribe to a topic.
    ///
    /// # Errors
    /// Returns [`BrokerError::Unavailable`] if the broker connection is down.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Live subscription to one topic.
///
/// Unsubscribes exactly once: on [`Subscription::unsubscribe`] or on drop,
/// whichever comes first.
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    /// Create a subscription from a delivery channel and its teardown action.
    pub fn new(
        topic: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Bytes>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next payload. `None` once the broker side has gone away.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Receive a payload that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok()
    }

    /// Whether the teardown action has not run yet.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }

    /// Stop receiving messages for this topic.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
            self.receiver.close();
            tracing::trace!(topic = %self.topic, "Unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
