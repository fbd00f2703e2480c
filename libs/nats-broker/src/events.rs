//! Connection lifecycle events.
//!
//! The client event callback and the drain routine both report on one
//! unbounded channel, so senders never block and order is preserved.

use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Lifecycle event of a broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// Error reported asynchronously by the server or client.
    AsyncError(String),
    SlowConsumer(u64),
    /// The server is about to shut down.
    LameDuck,
    /// The client started draining its subscriptions.
    Draining,
    /// The client closed the connection, after a drain or on close.
    Closed,
    DrainTimeout,
    Other(String),
}

impl ConnectionEvent {
    /// Events that end a drain wait.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Closed | ConnectionEvent::Disconnected | ConnectionEvent::DrainTimeout
        )
    }
}

impl From<async_nats::Event> for ConnectionEvent {
    #[allow(unreachable_patterns)]
    fn from(event: async_nats::Event) -> Self {
        match event {
            async_nats::Event::Connected => ConnectionEvent::Connected,
            async_nats::Event::Disconnected => ConnectionEvent::Disconnected,
            async_nats::Event::LameDuckMode => ConnectionEvent::LameDuck,
            async_nats::Event::Draining => ConnectionEvent::Draining,
            async_nats::Event::Closed => ConnectionEvent::Closed,
            async_nats::Event::SlowConsumer(sid) => ConnectionEvent::SlowConsumer(sid),
            async_nats::Event::ServerError(err) => ConnectionEvent::AsyncError(err.to_string()),
            async_nats::Event::ClientError(err) => ConnectionEvent::AsyncError(err.to_string()),
            other => ConnectionEvent::Other(format!("{other:?}")),
        }
    }
}

/// Sending half handed to the client event callback.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Ordered channel of lifecycle events owned by a broker.
#[derive(Debug)]
pub struct EventChannel {
    tx: EventSender,
    rx: Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    pub fn send(&self, event: ConnectionEvent) {
        // the receiver lives as long as self
        let _ = self.tx.send(event);
    }

    /// Drop events that arrived before now.
    pub async fn discard_pending(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// Receive the next event, if one arrives within `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Option<ConnectionEvent> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Read events until a terminal one arrives or `timeout` passes.
    pub async fn wait_for_terminal(&self, timeout: Duration) -> Option<ConnectionEvent> {
        let mut rx = self.rx.lock().await;
        let wait = async {
            while let Some(event) = rx.recv().await {
                if event.is_terminal() {
                    return Some(event);
                }
                debug!(?event, "skipping non-terminal event while draining");
            }
            None
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Log a client event and forward it.
pub(crate) fn forward(tx: &EventSender, event: async_nats::Event) {
    let event = ConnectionEvent::from(event);
    match &event {
        ConnectionEvent::Connected => info!("nats connection established"),
        ConnectionEvent::Disconnected => warn!("nats connection lost"),
        ConnectionEvent::AsyncError(err) => warn!(error = %err, "nats async error"),
        ConnectionEvent::SlowConsumer(sid) => warn!(sid, "nats slow consumer"),
        ConnectionEvent::LameDuck => warn!("nats server entered lame duck mode"),
        ConnectionEvent::Draining => info!("nats connection draining"),
        ConnectionEvent::Closed => info!("nats connection closed"),
        other => debug!(event = ?other, "nats connection event"),
    }
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(ConnectionEvent::Closed.is_terminal());
        assert!(ConnectionEvent::Disconnected.is_terminal());
        assert!(ConnectionEvent::DrainTimeout.is_terminal());
        assert!(!ConnectionEvent::Connected.is_terminal());
        assert!(!ConnectionEvent::SlowConsumer(3).is_terminal());
        assert!(!ConnectionEvent::Draining.is_terminal());
    }

    #[test]
    fn test_from_client_event() {
        assert_eq!(
            ConnectionEvent::from(async_nats::Event::Connected),
            ConnectionEvent::Connected
        );
        assert_eq!(
            ConnectionEvent::from(async_nats::Event::LameDuckMode),
            ConnectionEvent::LameDuck
        );
        assert_eq!(
            ConnectionEvent::from(async_nats::Event::SlowConsumer(7)),
            ConnectionEvent::SlowConsumer(7)
        );
    }

    #[test]
    fn test_client_close_ends_drain_wait() {
        let draining = ConnectionEvent::from(async_nats::Event::Draining);
        assert_eq!(draining, ConnectionEvent::Draining);
        assert!(!draining.is_terminal());

        let closed = ConnectionEvent::from(async_nats::Event::Closed);
        assert_eq!(closed, ConnectionEvent::Closed);
        assert!(closed.is_terminal());
    }

    #[tokio::test]
    async fn test_forwarded_client_events_reach_wait() {
        let events = EventChannel::new();
        let tx = events.sender();
        forward(&tx, async_nats::Event::Draining);
        forward(&tx, async_nats::Event::Closed);
        assert_eq!(
            events.wait_for_terminal(Duration::from_secs(1)).await,
            Some(ConnectionEvent::Closed)
        );
    }

    #[tokio::test]
    async fn test_wait_skips_to_terminal_event() {
        let events = EventChannel::new();
        events.send(ConnectionEvent::Connected);
        events.send(ConnectionEvent::SlowConsumer(1));
        events.send(ConnectionEvent::Closed);
        events.send(ConnectionEvent::Connected);

        let terminal = events.wait_for_terminal(Duration::from_secs(1)).await;
        assert_eq!(terminal, Some(ConnectionEvent::Closed));
        assert_eq!(
            events.recv(Duration::from_millis(10)).await,
            Some(ConnectionEvent::Connected)
        );
    }

    #[tokio::test]
    async fn test_discard_pending() {
        let events = EventChannel::new();
        events.send(ConnectionEvent::Disconnected);
        events.send(ConnectionEvent::Connected);
        assert_eq!(events.discard_pending().await, 2);
        assert_eq!(events.recv(Duration::from_millis(10)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_terminal_event() {
        let events = EventChannel::new();
        events.send(ConnectionEvent::Connected);
        let terminal = events.wait_for_terminal(Duration::from_secs(5)).await;
        assert_eq!(terminal, None);
    }

    #[tokio::test]
    async fn test_sender_from_callback_side() {
        let events = EventChannel::new();
        let tx = events.sender();
        tokio::spawn(async move {
            let _ = tx.send(ConnectionEvent::DrainTimeout);
        })
        .await
        .unwrap();
        assert_eq!(
            events.wait_for_terminal(Duration::from_secs(1)).await,
            Some(ConnectionEvent::DrainTimeout)
        );
    }
}
