//! The NATS [`Broker`] implementation.

use std::sync::Arc;

use async_nats::jetstream::{self, consumer, context::GetStreamErrorKind, stream};
use async_trait::async_trait;
use broker::{
    Broker, BrokerError, BrokerOptions, BrokerResult, DeliverPosition, Handler, PublishOptions,
    SpanKind, SubscribeOptions, Subscriber, SubscriberSyncMap, TlsOptions, Tracer,
};
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::connect::build_connect_options;
use crate::dispatch::{Dispatcher, MESSAGING_SYSTEM};
use crate::events::{ConnectionEvent, EventChannel, forward};
use crate::headers::to_header_map;
use crate::options::{ClientOptions, NatsOptions, normalize_addrs};
use crate::subscriber::{NatsSubscriber, run_core, run_stream};

/// Tracer name for publish spans.
pub const PRODUCER_TRACER: &str = "nats-producer";
/// Tracer name for receive spans.
pub const CONSUMER_TRACER: &str = "nats-consumer";

#[derive(Default)]
struct State {
    client: Option<async_nats::Client>,
    connected: bool,
    jetstream: Option<jetstream::Context>,
    stream: Option<stream::Stream>,
    producer: Option<Tracer>,
    consumer: Option<Tracer>,
}

#[derive(Debug, Clone)]
struct Settings {
    options: BrokerOptions,
    nats: NatsOptions,
    client: ClientOptions,
}

impl Settings {
    /// Compute every default up front.
    fn merge(mut options: BrokerOptions, nats: NatsOptions) -> BrokerResult<Self> {
        nats.validate()?;
        let client = nats.client.clone().unwrap_or_default();

        if options.addrs.iter().all(|addr| addr.trim().is_empty()) {
            options.addrs = client.servers.clone();
        }
        options.addrs = normalize_addrs(&options.addrs);

        if options.tls.is_none() && client.has_tls_material() {
            options.tls = Some(TlsOptions {
                ca_path: client.tls_ca_path.clone(),
                cert_path: client.tls_cert_path.clone(),
                key_path: client.tls_key_path.clone(),
            });
        }
        options.secure = options.secure || client.require_tls || options.tls.is_some();

        Ok(Self {
            options,
            nats,
            client,
        })
    }
}

/// Broker backed by a NATS connection, with JetStream when a stream is
/// configured.
pub struct NatsBroker {
    settings: RwLock<Settings>,
    state: RwLock<State>,
    subscribers: Arc<SubscriberSyncMap<NatsSubscriber>>,
    events: EventChannel,
}

impl NatsBroker {
    pub fn new(options: BrokerOptions, nats: NatsOptions) -> BrokerResult<Self> {
        Ok(Self {
            settings: RwLock::new(Settings::merge(options, nats)?),
            state: RwLock::new(State::default()),
            subscribers: Arc::new(SubscriberSyncMap::new()),
            events: EventChannel::new(),
        })
    }

    /// Change options before connecting. Defaults are computed again.
    pub async fn configure<F>(&self, f: F) -> BrokerResult<()>
    where
        F: FnOnce(&mut BrokerOptions, &mut NatsOptions),
    {
        let state = self.state.read().await;
        if state.client.is_some() {
            return Err(BrokerError::Config(
                "options cannot change while connected".into(),
            ));
        }
        let mut settings = self.settings.write().await;
        let mut options = settings.options.clone();
        let mut nats = settings.nats.clone();
        f(&mut options, &mut nats);
        *settings = Settings::merge(options, nats)?;
        Ok(())
    }

    pub async fn nats_options(&self) -> NatsOptions {
        self.settings.read().await.nats.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    /// Cached info of the configured stream, if connected in JetStream mode.
    pub async fn stream_info(&self) -> Option<stream::Info> {
        self.state
            .read()
            .await
            .stream
            .as_ref()
            .map(|s| s.cached_info().clone())
    }

    pub fn subscribers(&self) -> &SubscriberSyncMap<NatsSubscriber> {
        &self.subscribers
    }

    /// Lifecycle events reported by the client and the drain routine.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    async fn setup_stream(
        js: &jetstream::Context,
        config: &stream::Config,
    ) -> BrokerResult<stream::Stream> {
        let setup_err = |message: String| BrokerError::StreamSetup {
            stream: config.name.clone(),
            message,
        };

        let mut handle = match js.get_stream(&config.name).await {
            Ok(handle) => handle,
            Err(err) => match err.kind() {
                GetStreamErrorKind::JetStream(js_err)
                    if js_err.error_code() == jetstream::ErrorCode::STREAM_NOT_FOUND =>
                {
                    info!(stream = %config.name, "creating missing JetStream stream");
                    js.create_stream(config.clone())
                        .await
                        .map_err(|e| setup_err(format!("create failed: {e}")))?
                }
                _ => return Err(setup_err(format!("lookup failed: {err}"))),
            },
        };

        js.update_stream(config)
            .await
            .map_err(|e| setup_err(format!("update failed: {e}")))?;
        handle
            .info()
            .await
            .map_err(|e| setup_err(format!("info failed: {e}")))?;
        Ok(handle)
    }

    /// Drain every subscription, then the client, and wait for the client to
    /// report the connection closed. The whole drain shares one deadline.
    async fn drain(&self, client: &async_nats::Client) -> BrokerResult<()> {
        let timeout = self.settings.read().await.nats.drain_timeout();
        let deadline = Instant::now() + timeout;
        let stale = self.events.discard_pending().await;
        if stale > 0 {
            debug!(stale, "discarded connection events before draining");
        }

        let subscribers = self.subscribers.all().await;
        info!(subscriptions = subscribers.len(), ?timeout, "draining nats connection");
        let drained = tokio::time::timeout_at(deadline, async {
            for subscriber in &subscribers {
                subscriber.drain().await;
            }
            client.drain().await
        })
        .await;

        match drained {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(BrokerError::Drain(format!("client drain failed: {err}"))),
            Err(_) => {
                self.events.send(ConnectionEvent::DrainTimeout);
                for subscriber in &subscribers {
                    subscriber.abort().await;
                }
                return Err(BrokerError::Drain(format!("timed out after {timeout:?}")));
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.events.wait_for_terminal(remaining).await {
            Some(ConnectionEvent::DrainTimeout) => {
                Err(BrokerError::Drain(format!("timed out after {timeout:?}")))
            }
            Some(event) => {
                debug!(?event, "drain finished");
                Ok(())
            }
            None => {
                self.events.send(ConnectionEvent::DrainTimeout);
                Err(BrokerError::Drain(format!(
                    "connection not closed within {timeout:?}"
                )))
            }
        }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn address(&self) -> String {
        self.settings
            .read()
            .await
            .options
            .addrs
            .first()
            .cloned()
            .unwrap_or_default()
    }

    async fn options(&self) -> BrokerOptions {
        self.settings.read().await.options.clone()
    }

    async fn init(&self) -> BrokerResult<()> {
        let tracing = self.settings.read().await.options.tracing.clone();
        let mut state = self.state.write().await;
        match tracing {
            Some(tracing) => {
                state.producer = Some(Tracer::new(SpanKind::Producer, PRODUCER_TRACER, &tracing));
                state.consumer = Some(Tracer::new(SpanKind::Consumer, CONSUMER_TRACER, &tracing));
            }
            None => {
                state.producer = None;
                state.consumer = None;
            }
        }
        Ok(())
    }

    async fn connect(&self) -> BrokerResult<()> {
        let mut state = self.state.write().await;
        if state.client.is_some() {
            debug!("nats broker already connected, skipping connect");
            state.connected = true;
            return Ok(());
        }

        let settings = self.settings.read().await.clone();
        info!(
            servers = ?settings.options.addrs,
            security_mode = ?settings.client.security_mode,
            secure = settings.options.secure,
            jetstream = settings.nats.stream.is_some(),
            "connecting to nats"
        );

        let events = self.events.sender();
        let opts = build_connect_options(&settings.client, &settings.options)
            .await?
            .event_callback(move |event| {
                let events = events.clone();
                async move { forward(&events, event) }
            });
        let servers: Vec<&str> = settings.options.addrs.iter().map(String::as_str).collect();
        let client = opts.connect(servers).await.map_err(|e| {
            error!(error = %e, "nats connection failed");
            BrokerError::Connection(e.to_string())
        })?;

        if let Some(stream_config) = &settings.nats.stream {
            let js = jetstream::new(client.clone());
            let config = stream::Config::from(stream_config);
            match Self::setup_stream(&js, &config).await {
                Ok(handle) => {
                    info!(stream = %config.name, subjects = ?config.subjects, "jetstream stream ready");
                    state.jetstream = Some(js);
                    state.stream = Some(handle);
                }
                Err(err) => {
                    error!(error = %err, "stream setup failed, dropping connection");
                    return Err(err);
                }
            }
        }

        state.client = Some(client);
        state.connected = true;
        info!("nats broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        let drain = self.settings.read().await.nats.drain;
        let mut result = Ok(());
        {
            let state = self.state.read().await;
            if let (true, Some(client)) = (drain, state.client.as_ref()) {
                result = self.drain(client).await;
                if let Err(err) = &result {
                    warn!(error = %err, "drain failed, closing anyway");
                }
            }
        }

        // detach the connection first so concurrent publish and subscribe
        // calls fail with NotConnected instead of registering late
        let client = {
            let mut state = self.state.write().await;
            state.stream = None;
            state.jetstream = None;
            state.connected = false;
            state.client.take()
        };
        self.subscribers.clear().await;
        drop(client);

        info!("nats broker disconnected");
        result
    }

    async fn publish_raw(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> BrokerResult<()> {
        let state = self.state.read().await;
        let client = state.client.as_ref().ok_or(BrokerError::NotConnected)?;

        let mut headers = options.headers;
        let span = state
            .producer
            .as_ref()
            .map(|tracer| tracer.start(MESSAGING_SYSTEM, topic, &mut headers));
        let header_map = to_header_map(&headers);
        let publish_err = |message: String| BrokerError::Publish {
            topic: topic.to_owned(),
            message,
        };

        let sent = async {
            match &state.jetstream {
                Some(js) => {
                    let ack = js
                        .publish_with_headers(topic.to_owned(), header_map, payload)
                        .await
                        .map_err(|e| publish_err(e.to_string()))?;
                    ack.await.map_err(|e| publish_err(format!("ack: {e}")))?;
                }
                None => client
                    .publish_with_headers(topic.to_owned(), header_map, payload)
                    .await
                    .map_err(|e| publish_err(e.to_string()))?,
            }
            Ok::<(), BrokerError>(())
        }
        .instrument(span.clone().unwrap_or_else(Span::none))
        .await;

        if let (Some(tracer), Some(span)) = (&state.producer, span) {
            tracer.end(span, sent.as_ref().err());
        }
        match &sent {
            Ok(()) => debug!(topic, "published"),
            Err(err) => warn!(topic, error = %err, "publish failed"),
        }
        sent
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Handler,
        options: SubscribeOptions,
    ) -> BrokerResult<Arc<dyn Subscriber>> {
        let state = self.state.read().await;
        let client = state.client.as_ref().ok_or(BrokerError::NotConnected)?;
        let broker_options = self.settings.read().await.options.clone();

        let subscribe_err = |message: String| BrokerError::Subscribe {
            topic: topic.to_owned(),
            message,
        };
        let dispatcher = Dispatcher {
            handler,
            codec: broker_options.codec,
            error_handler: broker_options.error_handler.clone(),
            auto_ack: options.auto_ack,
            tracer: state.consumer.clone(),
        };
        let (subscriber, stop) =
            NatsSubscriber::new(topic, options.clone(), Arc::downgrade(&self.subscribers));
        let subscriber = Arc::new(subscriber);
        let task_topic = topic.to_owned();

        let task = match &state.stream {
            Some(stream) => {
                let config = consumer::pull::Config {
                    durable_name: options.queue.clone(),
                    filter_subject: topic.to_owned(),
                    deliver_policy: deliver_policy(options.deliver.unwrap_or_default()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                };
                let consumer = match &options.queue {
                    Some(queue) => stream
                        .get_or_create_consumer(queue, config)
                        .await
                        .map_err(|e| subscribe_err(format!("consumer '{queue}': {e}")))?,
                    None => stream
                        .create_consumer(config)
                        .await
                        .map_err(|e| subscribe_err(format!("consumer: {e}")))?,
                };
                let messages = consumer
                    .messages()
                    .await
                    .map_err(|e| subscribe_err(format!("messages: {e}")))?;
                tokio::spawn(run_stream(messages, dispatcher, stop, task_topic))
            }
            None => {
                let subscription = match &options.queue {
                    Some(queue) => client
                        .queue_subscribe(topic.to_owned(), queue.clone())
                        .await
                        .map_err(|e| subscribe_err(e.to_string()))?,
                    None => client
                        .subscribe(topic.to_owned())
                        .await
                        .map_err(|e| subscribe_err(e.to_string()))?,
                };
                tokio::spawn(run_core(subscription, dispatcher, stop, task_topic))
            }
        };
        subscriber.attach(task).await;
        self.subscribers.add(topic, Arc::clone(&subscriber)).await;

        info!(
            topic,
            id = subscriber.id(),
            queue = ?options.queue,
            jetstream = state.stream.is_some(),
            "subscribed"
        );
        Ok(subscriber)
    }
}

impl std::fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroker")
            .field("subscribers", &self.subscribers)
            .finish_non_exhaustive()
    }
}

fn deliver_policy(position: DeliverPosition) -> consumer::DeliverPolicy {
    match position {
        DeliverPosition::All => consumer::DeliverPolicy::All,
        DeliverPosition::New => consumer::DeliverPolicy::New,
        DeliverPosition::Last => consumer::DeliverPolicy::Last,
    }
}
