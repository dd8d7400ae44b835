//! In-process broker.

use super::{
    BusMessage, MessageBus, SUBSCRIPTION_CAPACITY, Subscription, topic_matches, validate_filter,
    validate_topic,
};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

struct Subscriber {
    filter: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Broker living inside the daemon. Clones share subscribers.
///
/// Publishing never waits: a subscriber whose buffer is full misses the
/// message, and closed subscriptions are pruned on the next publish.
#[derive(Clone, Default)]
pub struct LocalBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    /// Delivers to every matching subscriber and returns how many got it.
    fn deliver(&self, topic: &str, payload: Value) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| topic_matches(&s.filter, topic)) {
            let message = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match subscriber.tx.try_send(message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(%topic, filter = %subscriber.filter, error = %e, "subscriber lagging, message dropped");
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        validate_topic(topic)?;
        let delivered = self.deliver(topic, payload);
        tracing::trace!(%topic, delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        validate_filter(filter)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.lock().push(Subscriber {
            filter: filter.to_string(),
            tx,
        });
        tracing::debug!(%filter, "subscribed");
        Ok(Subscription::new(rx))
    }
}
