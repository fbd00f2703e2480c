//! Subscription handle and its delivery task.

use std::sync::Weak;

use async_nats::jetstream::consumer::pull;
use async_trait::async_trait;
use broker::{BrokerResult, SubscribeOptions, Subscriber, SubscriberSyncMap};
use futures::StreamExt;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;

/// How a delivery task stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// Stop after the in-flight message.
    Abort,
    /// Also handle messages the client already buffered.
    Drain,
}

/// Live NATS subscription.
///
/// Delivery runs on its own task, one message at a time. `unsubscribe` and
/// `drain` wait for that task, so they must not be awaited from inside this
/// subscription's own handler.
pub struct NatsSubscriber {
    id: String,
    topic: String,
    options: SubscribeOptions,
    stop: Mutex<Option<oneshot::Sender<StopMode>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    registry: Weak<SubscriberSyncMap<NatsSubscriber>>,
}

impl NatsSubscriber {
    pub(crate) fn new(
        topic: &str,
        options: SubscribeOptions,
        registry: Weak<SubscriberSyncMap<NatsSubscriber>>,
    ) -> (Self, oneshot::Receiver<StopMode>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let subscriber = Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_owned(),
            options,
            stop: Mutex::new(Some(stop_tx)),
            task: Mutex::new(None),
            registry,
        };
        (subscriber, stop_rx)
    }

    pub(crate) async fn attach(&self, task: JoinHandle<()>) {
        *self.task.lock().await = Some(task);
    }

    /// Finish buffered messages, then stop.
    pub async fn drain(&self) {
        self.stop_with(StopMode::Drain).await;
    }

    /// False once the delivery task has been stopped.
    pub async fn is_active(&self) -> bool {
        self.stop.lock().await.is_some()
    }

    /// Cancel the delivery task without waiting for the in-flight message.
    pub(crate) async fn abort(&self) {
        self.stop.lock().await.take();
        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_mut() {
            handle.abort();
            Self::join(handle, &self.topic, &self.id).await;
        }
        *task = None;
    }

    async fn stop_with(&self, mode: StopMode) {
        let signalled = match self.stop.lock().await.take() {
            Some(stop) => stop.send(mode).is_ok(),
            None => false,
        };
        // the handle stays in place until the task has finished, so a
        // cancelled wait leaves it reachable for a later abort
        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_mut() {
            if !signalled && mode == StopMode::Abort {
                handle.abort();
            }
            Self::join(handle, &self.topic, &self.id).await;
        }
        *task = None;
    }

    async fn join(handle: &mut JoinHandle<()>, topic: &str, id: &str) {
        match handle.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => debug!(topic, id, "delivery task aborted"),
            Err(err) => warn!(topic, id, error = %err, "delivery task failed"),
        }
    }
}

#[async_trait]
impl Subscriber for NatsSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    async fn unsubscribe(&self, remove_from_registry: bool) -> BrokerResult<()> {
        self.stop_with(StopMode::Abort).await;
        if remove_from_registry {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(&self.topic, &self.id).await;
            }
        }
        debug!(topic = %self.topic, id = %self.id, "unsubscribed");
        Ok(())
    }
}

impl std::fmt::Debug for NatsSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsSubscriber")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Deliver core messages until stopped or the subscription closes.
pub(crate) async fn run_core(
    mut subscription: async_nats::Subscriber,
    dispatcher: Dispatcher,
    mut stop: oneshot::Receiver<StopMode>,
    topic: String,
) {
    loop {
        tokio::select! {
            biased;
            mode = &mut stop => {
                if let Err(err) = subscription.unsubscribe().await {
                    warn!(topic = %topic, error = %err, "unsubscribe failed");
                }
                if mode == Ok(StopMode::Drain) {
                    let mut drained = 0usize;
                    while let Some(message) = subscription.next().await {
                        dispatcher.dispatch(&message).await;
                        drained += 1;
                    }
                    info!(topic = %topic, drained, "subscription drained");
                }
                break;
            }
            next = subscription.next() => match next {
                Some(message) => dispatcher.dispatch(&message).await,
                None => break,
            },
        }
    }
    debug!(topic = %topic, "core delivery stopped");
}

/// Deliver JetStream messages from a pull consumer until stopped.
///
/// Messages fetched but not yet handled are left unacknowledged and will be
/// redelivered by the server.
pub(crate) async fn run_stream(
    mut messages: pull::Stream,
    dispatcher: Dispatcher,
    mut stop: oneshot::Receiver<StopMode>,
    topic: String,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            next = messages.next() => match next {
                Some(Ok(message)) => dispatcher.dispatch(&message).await,
                Some(Err(err)) => warn!(topic = %topic, error = %err, "pull consumer error"),
                None => break,
            },
        }
    }
    debug!(topic = %topic, "stream delivery stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_unsubscribe_stops_task_and_leaves_registry() {
        let registry = Arc::new(SubscriberSyncMap::<NatsSubscriber>::new());
        let (subscriber, stop_rx) =
            NatsSubscriber::new("orders.*", SubscribeOptions::new(), Arc::downgrade(&registry));
        let subscriber = Arc::new(subscriber);

        let (seen_tx, seen_rx) = oneshot::channel();
        subscriber
            .attach(tokio::spawn(async move {
                let mode = stop_rx.await;
                let _ = seen_tx.send(mode);
            }))
            .await;
        registry.add("orders.*", Arc::clone(&subscriber)).await;

        assert!(subscriber.is_active().await);
        subscriber.unsubscribe(true).await.unwrap();

        assert_eq!(seen_rx.await.unwrap(), Ok(StopMode::Abort));
        assert!(!subscriber.is_active().await);
        assert!(registry.is_empty().await);

        // second call is a no-op
        subscriber.unsubscribe(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_signals_drain_mode() {
        let registry = Arc::new(SubscriberSyncMap::<NatsSubscriber>::new());
        let (subscriber, stop_rx) =
            NatsSubscriber::new("orders.*", SubscribeOptions::new(), Arc::downgrade(&registry));
        let (seen_tx, seen_rx) = oneshot::channel();
        subscriber
            .attach(tokio::spawn(async move {
                let _ = seen_tx.send(stop_rx.await);
            }))
            .await;

        subscriber.drain().await;
        assert_eq!(seen_rx.await.unwrap(), Ok(StopMode::Drain));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_after_interrupted_drain_cancels_task() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let registry = Arc::new(SubscriberSyncMap::<NatsSubscriber>::new());
        let (subscriber, _stop_rx) =
            NatsSubscriber::new("orders.*", SubscribeOptions::new(), Arc::downgrade(&registry));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        // a handler that ignores the stop signal
        subscriber
            .attach(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(600)).await;
                flag.store(true, Ordering::SeqCst);
            }))
            .await;

        let drained = tokio::time::timeout(Duration::from_millis(50), subscriber.drain()).await;
        assert!(drained.is_err());
        assert!(subscriber.task.lock().await.is_some());

        subscriber.unsubscribe(false).await.unwrap();
        assert!(subscriber.task.lock().await.is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_running_task() {
        use std::time::Duration;

        let registry = Arc::new(SubscriberSyncMap::<NatsSubscriber>::new());
        let (subscriber, _stop_rx) =
            NatsSubscriber::new("orders.*", SubscribeOptions::new(), Arc::downgrade(&registry));
        subscriber
            .attach(tokio::spawn(tokio::time::sleep(Duration::from_secs(3600))))
            .await;

        subscriber.abort().await;
        assert!(!subscriber.is_active().await);
        assert!(subscriber.task.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let registry = Arc::new(SubscriberSyncMap::<NatsSubscriber>::new());
        let (a, _) = NatsSubscriber::new("t", SubscribeOptions::new(), Arc::downgrade(&registry));
        let (b, _) = NatsSubscriber::new("t", SubscribeOptions::new(), Arc::downgrade(&registry));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.topic(), "t");
        assert!(a.options().auto_ack);
    }
}
