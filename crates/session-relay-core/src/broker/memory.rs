//! In-memory broker.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Broker, BrokerError, Subscription};

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Bytes>,
}

struct Inner {
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

/// In-memory pub/sub broker.
///
/// Useful for development, tests and single-process deployments where
/// every "instance" shares one address space. Clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create a new, connected broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate losing the broker connection. Live subscriptions end, and
    /// publish and subscribe fail fast until [`MemoryBroker::reconnect`].
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        // Dropping the senders ends every subscription stream.
        if let Ok(mut topics) = self.inner.topics.write() {
            topics.clear();
        }
    }

    /// Restore the broker connection.
    pub fn reconnect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
    }

    /// Number of live subscriptions on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .map(|topics| topics.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Number of topics with at least one subscription.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.topics.read().map(|t| t.len()).unwrap_or(0)
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker disconnected".to_owned()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_subscriber(inner: &Inner, topic: &str, id: u64) {
    let Ok(mut topics) = inner.topics.write() else {
        return;
    };
    if let Some(subscribers) = topics.get_mut(topic) {
        subscribers.retain(|s| s.id != id);
        if subscribers.is_empty() {
            topics.remove(topic);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BrokerError> {
        self.ensure_connected()?;

        let topics = self
            .inner
            .topics
            .read()
            .map_err(|e| BrokerError::Internal(e.to_string()))?;

        let delivered = topics.get(topic).map_or(0, |subscribers| {
            subscribers
                .iter()
                .filter(|s| s.sender.send(payload.clone()).is_ok())
                .count()
        });

        tracing::trace!(topic, delivered, "Published");
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        self.ensure_connected()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        self.inner
            .topics
            .write()
            .map_err(|e| BrokerError::Internal(e.to_string()))?
            .entry(topic.to_owned())
            .or_default()
            .push(Subscriber { id, sender });

        let inner = Arc::clone(&self.inner);
        let owned_topic = topic.to_owned();
        Ok(Subscription::new(topic, receiver, move || {
            remove_subscriber(&inner, &owned_topic, id);
        }))
    }
}
