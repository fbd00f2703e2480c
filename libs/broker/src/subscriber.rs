//! Subscription handles and the per-broker subscriber registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::BrokerResult;
use crate::options::SubscribeOptions;

/// A live subscription returned by `Broker::subscribe`.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Unique id, stable for the lifetime of the subscription.
    fn id(&self) -> &str;

    fn topic(&self) -> &str;

    fn options(&self) -> &SubscribeOptions;

    /// Stop delivery. The in-flight message, if any, finishes first.
    ///
    /// With `remove_from_registry` the subscription is also dropped from the
    /// broker's registry.
    async fn unsubscribe(&self, remove_from_registry: bool) -> BrokerResult<()>;
}

/// Topic-keyed set of live subscriptions.
///
/// Several subscriptions may share a topic. Removing an entry twice is a
/// no-op and `clear` can be called any number of times.
pub struct SubscriberSyncMap<S: ?Sized> {
    inner: RwLock<HashMap<String, Vec<Arc<S>>>>,
}

impl<S: Subscriber + ?Sized> SubscriberSyncMap<S> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, topic: &str, subscriber: Arc<S>) {
        let mut inner = self.inner.write().await;
        let entries = inner.entry(topic.to_owned()).or_default();
        if entries.iter().any(|s| s.id() == subscriber.id()) {
            return;
        }
        entries.push(subscriber);
    }

    /// Remove one subscription without unsubscribing it.
    pub async fn remove(&self, topic: &str, id: &str) -> Option<Arc<S>> {
        let mut inner = self.inner.write().await;
        let entries = inner.get_mut(topic)?;
        let pos = entries.iter().position(|s| s.id() == id)?;
        let removed = entries.remove(pos);
        if entries.is_empty() {
            inner.remove(topic);
        }
        Some(removed)
    }

    /// Remove every subscription on `topic` and unsubscribe them.
    pub async fn remove_topic(&self, topic: &str) {
        let removed = self.inner.write().await.remove(topic).unwrap_or_default();
        unsubscribe_all(removed).await;
    }

    pub async fn get(&self, topic: &str) -> Vec<Arc<S>> {
        self.inner
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Every registered subscription, in no particular order.
    pub async fn all(&self) -> Vec<Arc<S>> {
        self.inner
            .read()
            .await
            .values()
            .flat_map(|entries| entries.iter().cloned())
            .collect()
    }

    pub async fn topics(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// Number of live subscriptions across all topics.
    pub async fn len(&self) -> usize {
        self.inner.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Unsubscribe and forget every subscription.
    pub async fn clear(&self) {
        let drained: Vec<Arc<S>> = {
            let mut inner = self.inner.write().await;
            inner.drain().flat_map(|(_, entries)| entries).collect()
        };
        debug!(count = drained.len(), "clearing subscriber registry");
        unsubscribe_all(drained).await;
    }
}

async fn unsubscribe_all<S: Subscriber + ?Sized>(subscribers: Vec<Arc<S>>) {
    for subscriber in subscribers {
        if let Err(err) = subscriber.unsubscribe(false).await {
            warn!(
                topic = subscriber.topic(),
                id = subscriber.id(),
                error = %err,
                "unsubscribe failed"
            );
        }
    }
}

impl<S: Subscriber + ?Sized> Default for SubscriberSyncMap<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized> std::fmt::Debug for SubscriberSyncMap<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSyncMap").finish_non_exhaustive()
    }
}
