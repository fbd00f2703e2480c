//! Subscriber-registration server.
//!
//! A [`Server`] owns a [`NatsBroker`]. Subscribers registered before
//! [`Server::start`] are subscribed when it starts; later registrations are
//! subscribed right away. [`Server::stop`] disconnects the broker and keeps
//! the registrations, so a stopped server can be started again.

use std::future::Future;
use std::sync::Arc;

use broker::{
    Broker, BrokerError, BrokerOptions, BrokerResult, Codec, ErrorHandler, Handler, Headers, Publication,
    SubscribeOptions, TlsOptions, TracingOptions,
};
use nats_broker::{NatsBroker, NatsOptions, StreamConfig};
use opentelemetry::propagation::TextMapPropagator;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct Registration {
    topic: String,
    handler: Handler,
    options: SubscribeOptions,
}

#[derive(Debug, Default)]
struct Registry {
    started: bool,
    subscriptions: Vec<Registration>,
}

/// Builds a [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    options: BrokerOptions,
    nats: NatsOptions,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = self.options.with_addrs(addrs);
        self
    }

    /// TLS material; also enables the secure flag.
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.options = self.options.with_tls(tls);
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.options = self.options.with_codec(codec);
        self
    }

    pub fn tracing(mut self, tracing: TracingOptions) -> Self {
        self.options = self.options.with_tracing(tracing);
        self
    }

    /// Trace through the globally installed propagator.
    pub fn global_propagator(self) -> Self {
        self.tracing(TracingOptions::global())
    }

    pub fn propagator(self, propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        self.tracing(TracingOptions::with_propagator(propagator))
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.options = self.options.with_error_handler(handler);
        self
    }

    /// Replace the generic broker options wholesale.
    pub fn broker_options(mut self, options: BrokerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn nats_options(mut self, nats: NatsOptions) -> Self {
        self.nats = nats;
        self
    }

    pub fn jetstream(mut self, stream: StreamConfig) -> Self {
        self.nats = self.nats.with_stream(stream);
        self
    }

    /// Drain subscriptions on stop.
    pub fn drain(mut self) -> Self {
        self.nats = self.nats.with_drain();
        self
    }

    pub fn build(self) -> BrokerResult<Server> {
        Ok(Server {
            broker: Arc::new(NatsBroker::new(self.options, self.nats)?),
            registry: Mutex::new(Registry::default()),
        })
    }
}

/// Message server driven by NATS subscriptions.
#[derive(Debug)]
pub struct Server {
    broker: Arc<NatsBroker>,
    registry: Mutex<Registry>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn broker(&self) -> &Arc<NatsBroker> {
        &self.broker
    }

    /// Broker endpoint, e.g. `nats://127.0.0.1:4222`.
    pub async fn endpoint(&self) -> String {
        self.broker.address().await
    }

    pub async fn is_started(&self) -> bool {
        self.registry.lock().await.started
    }

    /// Register a handler for `topic` receiving the decoded body of type `T`.
    pub async fn register_subscriber<T, F, Fut>(
        &self,
        topic: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> BrokerResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(String, Headers, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = broker::HandlerResult> + Send + 'static,
    {
        let handler = Handler::typed(move |publication: Publication<T>| {
            let topic = publication.topic().to_owned();
            let message = publication.into_message();
            handler(topic, message.headers, message.body)
        });
        let registration = Registration {
            topic: topic.to_owned(),
            handler,
            options,
        };

        let mut registry = self.registry.lock().await;
        if registry.started {
            self.subscribe(&registration).await?;
        }
        registry.subscriptions.push(registration);
        Ok(())
    }

    /// Connect and subscribe every registered handler.
    pub async fn start(&self) -> BrokerResult<()> {
        let mut registry = self.registry.lock().await;
        if registry.started {
            return Ok(());
        }

        self.broker.init().await?;
        self.broker.connect().await?;
        for registration in &registry.subscriptions {
            if let Err(err) = self.subscribe(registration).await {
                warn!(topic = %registration.topic, error = %err, "subscribe failed, stopping");
                let rollback = self.broker.disconnect().await;
                return Err(first_error(err, rollback));
            }
        }
        registry.started = true;

        info!(
            endpoint = %self.broker.address().await,
            subscriptions = registry.subscriptions.len(),
            "server listening"
        );
        Ok(())
    }

    /// Disconnect the broker.
    pub async fn stop(&self) -> BrokerResult<()> {
        let mut registry = self.registry.lock().await;
        if !registry.started {
            return Ok(());
        }
        registry.started = false;
        info!("server stopping");
        self.broker.disconnect().await
    }

    async fn subscribe(&self, registration: &Registration) -> BrokerResult<()> {
        self.broker
            .subscribe(
                &registration.topic,
                registration.handler.clone(),
                registration.options.clone(),
            )
            .await?;
        Ok(())
    }
}

/// Keep the error that caused a rollback, logging a failed rollback.
fn first_error(cause: BrokerError, rollback: BrokerResult<()>) -> BrokerError {
    if let Err(err) = rollback {
        warn!(error = %err, "disconnect after failed start also failed");
    }
    cause
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use serde::Deserialize;
    use tracing_test::traced_test;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Hygrothermograph {
        #[allow(dead_code)]
        humidity: f64,
    }

    async fn on_reading(
        topic: String,
        headers: Headers,
        reading: Hygrothermograph,
    ) -> broker::HandlerResult {
        info!(%topic, ?headers, ?reading, "reading");
        Ok(())
    }

    fn unreachable() -> ServerBuilder {
        let client = nats_broker::ClientOptions {
            connect_timeout_ms: Some(200),
            max_reconnects: Some(0),
            ..Default::default()
        };
        Server::builder()
            .address(["nats://127.0.0.1:1"])
            .nats_options(NatsOptions::new().with_client_options(client))
    }

    #[tokio::test]
    async fn test_builder_applies_options() {
        let server = Server::builder()
            .address(["127.0.0.1:4222"])
            .codec(Codec::Yaml)
            .propagator(Arc::new(TraceContextPropagator::new()))
            .jetstream(StreamConfig::new("stream-1", ["stream.*"]))
            .drain()
            .build()
            .unwrap();

        assert_eq!(server.endpoint().await, "nats://127.0.0.1:4222");
        let options = server.broker().options().await;
        assert_eq!(options.codec, Codec::Yaml);
        assert!(options.tracing.is_some());
        let nats = server.broker().nats_options().await;
        assert!(nats.drain);
        assert_eq!(nats.stream.map(|s| s.name), Some("stream-1".to_owned()));
    }

    #[test]
    fn test_tls_enables_secure() {
        let builder = Server::builder().tls(TlsOptions::default());
        assert!(builder.options.secure);
    }

    #[test]
    fn test_invalid_stream_fails_build() {
        let result = Server::builder()
            .jetstream(StreamConfig::new("stream.1", ["stream.*"]))
            .build();
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }

    #[tokio::test]
    async fn test_registrations_are_kept_until_start() {
        let server = unreachable().build().unwrap();
        server
            .register_subscriber(
                "stream.1",
                on_reading,
                SubscribeOptions::new().queue("stream-1-group").deliver_all(),
            )
            .await
            .unwrap();
        server
            .register_subscriber(
                "stream.2",
                on_reading,
                SubscribeOptions::new().queue("stream-2-group"),
            )
            .await
            .unwrap();

        assert!(!server.is_started().await);
        assert_eq!(server.registry.lock().await.subscriptions.len(), 2);
        assert!(server.broker().subscribers().is_empty().await);
    }

    #[traced_test]
    #[test]
    fn test_failed_rollback_keeps_subscribe_error() {
        let cause = BrokerError::Subscribe {
            topic: "stream.1".into(),
            message: "consumer filter outside stream subjects".into(),
        };
        let rollback = Err(BrokerError::Drain("timed out after 30s".into()));

        assert_eq!(first_error(cause.clone(), rollback), cause);
        assert!(logs_contain("disconnect after failed start also failed"));
        assert_eq!(first_error(cause.clone(), Ok(())), cause);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_start_without_server_fails() {
        let server = unreachable().build().unwrap();
        let err = tokio::time::timeout(Duration::from_secs(10), server.start())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
        assert!(!server.is_started().await);

        // stopping a server that never started is a no-op
        server.stop().await.unwrap();
    }
}
