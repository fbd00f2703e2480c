//! Producer/consumer spans with trace context carried in message headers.
//!
//! Spans are `tracing` spans. When the application installs a
//! `tracing-opentelemetry` layer they are exported as OpenTelemetry spans;
//! the `otel.*` fields set the span kind, name and status.

use std::sync::Arc;

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use tracing::{Span, field};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::error::BrokerError;
use crate::message::Headers;

/// Text-map propagator used to move trace context through headers.
#[derive(Debug, Clone, Default)]
pub enum Propagator {
    /// Whatever `opentelemetry::global::set_text_map_propagator` installed.
    #[default]
    Global,
    Custom(Arc<dyn TextMapPropagator + Send + Sync>),
}

impl Propagator {
    fn inject(&self, cx: &opentelemetry::Context, injector: &mut dyn Injector) {
        match self {
            Propagator::Global => opentelemetry::global::get_text_map_propagator(|propagator| {
                propagator.inject_context(cx, injector)
            }),
            Propagator::Custom(propagator) => propagator.inject_context(cx, injector),
        }
    }

    fn extract(&self, extractor: &dyn Extractor) -> opentelemetry::Context {
        match self {
            Propagator::Global => opentelemetry::global::get_text_map_propagator(|propagator| {
                propagator.extract(extractor)
            }),
            Propagator::Custom(propagator) => propagator.extract(extractor),
        }
    }
}

/// Enables span creation on a broker.
#[derive(Debug, Clone, Default)]
pub struct TracingOptions {
    pub propagator: Propagator,
}

impl TracingOptions {
    /// Use the globally installed propagator.
    pub fn global() -> Self {
        Self::default()
    }

    pub fn with_propagator(propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        Self {
            propagator: Propagator::Custom(propagator),
        }
    }
}

/// Writes trace context into a header mapping.
#[derive(Debug)]
pub struct HeaderInjector<'a>(pub &'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_owned(), vec![value]);
    }
}

/// Reads trace context from a header mapping.
#[derive(Debug, Clone, Copy)]
pub struct HeaderExtractor<'a>(pub &'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Which side of a message exchange a span describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }
}

/// Starts and ends messaging spans of one kind.
#[derive(Debug, Clone)]
pub struct Tracer {
    kind: SpanKind,
    name: String,
    propagator: Propagator,
}

impl Tracer {
    pub fn new(kind: SpanKind, name: impl Into<String>, options: &TracingOptions) -> Self {
        Self {
            kind,
            name: name.into(),
            propagator: options.propagator.clone(),
        }
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a span for a message on `destination`.
    ///
    /// Producer spans inject their context into `headers`; consumer spans use
    /// the context found in `headers` as their parent.
    pub fn start(&self, system: &'static str, destination: &str, headers: &mut Headers) -> Span {
        match self.kind {
            SpanKind::Producer => {
                let span = tracing::info_span!(
                    "broker.publish",
                    otel.name = %format!("{destination} publish"),
                    otel.kind = SpanKind::Producer.as_str(),
                    otel.status_code = field::Empty,
                    otel.status_message = field::Empty,
                    messaging.system = system,
                    messaging.destination_kind = "topic",
                    messaging.destination = %destination,
                    tracer = %self.name
                );
                let cx = span.context();
                self.propagator.inject(&cx, &mut HeaderInjector(headers));
                span
            }
            SpanKind::Consumer => {
                let parent = self.propagator.extract(&HeaderExtractor(headers));
                let span = tracing::info_span!(
                    "broker.receive",
                    otel.name = %format!("{destination} receive"),
                    otel.kind = SpanKind::Consumer.as_str(),
                    otel.status_code = field::Empty,
                    otel.status_message = field::Empty,
                    messaging.system = system,
                    messaging.destination_kind = "topic",
                    messaging.destination = %destination,
                    messaging.operation = "receive",
                    tracer = %self.name
                );
                span.set_parent(parent);
                span
            }
        }
    }

    /// End `span`, marking it failed when `error` is set.
    pub fn end(&self, span: Span, error: Option<&BrokerError>) {
        if let Some(err) = error {
            span.record("otel.status_code", "ERROR");
            span.record("otel.status_message", field::display(err));
        }
        drop(span);
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_test::traced_test;

    use super::*;

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN_ID: &str = "00f067aa0ba902b7";

    fn remote_context() -> opentelemetry::Context {
        let span_context = SpanContext::new(
            TraceId::from_hex(TRACE_ID).unwrap(),
            SpanId::from_hex(SPAN_ID).unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        opentelemetry::Context::new().with_remote_span_context(span_context)
    }

    #[test]
    fn test_carrier_round_trip_through_headers() {
        let propagator = Propagator::Custom(Arc::new(TraceContextPropagator::new()));
        let mut headers = Headers::new();
        headers.insert("x-tenant".into(), vec!["acme".into()]);

        propagator.inject(&remote_context(), &mut HeaderInjector(&mut headers));

        let traceparent = &headers["traceparent"];
        assert_eq!(traceparent.len(), 1);
        assert!(traceparent[0].contains(TRACE_ID));
        assert_eq!(headers["x-tenant"], vec!["acme"]);

        let cx = propagator.extract(&HeaderExtractor(&headers));
        assert_eq!(
            cx.span().span_context().trace_id(),
            TraceId::from_hex(TRACE_ID).unwrap()
        );
    }

    #[test]
    fn test_extractor_reads_first_value() {
        let mut headers = Headers::new();
        headers.insert("k".into(), vec!["first".into(), "second".into()]);
        headers.insert("empty".into(), vec![]);
        let extractor = HeaderExtractor(&headers);

        assert_eq!(extractor.get("k"), Some("first"));
        assert_eq!(extractor.get("empty"), None);
        assert_eq!(extractor.get("missing"), None);

        let mut keys = extractor.keys();
        keys.sort_unstable();
        assert_eq!(keys, vec!["empty", "k"]);
    }

    #[test]
    fn test_injector_replaces_existing_values() {
        let mut headers = Headers::new();
        headers.insert("traceparent".into(), vec!["stale".into(), "older".into()]);
        HeaderInjector(&mut headers).set("traceparent", "fresh".into());
        assert_eq!(headers["traceparent"], vec!["fresh"]);
    }

    #[traced_test]
    #[test]
    fn test_consumer_span_accepts_propagated_context() {
        let options = TracingOptions::with_propagator(Arc::new(TraceContextPropagator::new()));
        let tracer = Tracer::new(SpanKind::Consumer, "nats-consumer", &options);
        assert_eq!(tracer.kind(), SpanKind::Consumer);
        assert_eq!(tracer.name(), "nats-consumer");

        let mut headers = Headers::new();
        TraceContextPropagator::new()
            .inject_context(&remote_context(), &mut HeaderInjector(&mut headers));

        let received = headers.clone();
        let span = tracer.start("nats", "orders.created", &mut headers);
        tracer.end(span, Some(&BrokerError::Handler("boom".into())));

        // consumer spans never write headers
        assert_eq!(headers, received);
        assert!(headers["traceparent"][0].contains(TRACE_ID));
    }

    #[traced_test]
    #[test]
    fn test_producer_span_without_exporter_leaves_headers_alone() {
        let tracer = Tracer::new(SpanKind::Producer, "nats-producer", &TracingOptions::global());
        let mut headers = Headers::new();
        let span = tracer.start("nats", "orders.created", &mut headers);
        tracer.end(span, None);
        assert!(headers.is_empty());
    }

    /// Subscriber exporting `tracing` spans through an in-process SDK tracer.
    fn otel_subscriber() -> impl tracing::Subscriber + Send + Sync {
        use opentelemetry::trace::TracerProvider as _;

        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let tracer = provider.tracer("broker-tests");
        tracing_subscriber::registry().with(tracing_opentelemetry::layer().with_tracer(tracer))
    }

    #[test]
    fn test_consumer_span_continues_producer_trace() {
        let options = TracingOptions::with_propagator(Arc::new(TraceContextPropagator::new()));
        let producer = Tracer::new(SpanKind::Producer, "nats-producer", &options);
        let consumer = Tracer::new(SpanKind::Consumer, "nats-consumer", &options);

        tracing::subscriber::with_default(otel_subscriber(), || {
            let mut headers = Headers::new();
            let publish = producer.start("nats", "orders.created", &mut headers);
            let sent = publish.context().span().span_context().clone();
            assert!(sent.is_valid());
            assert!(headers["traceparent"][0].contains(&sent.trace_id().to_string()));
            producer.end(publish, None);

            let receive = consumer.start("nats", "orders.created", &mut headers);
            let received = receive.context().span().span_context().clone();
            assert_eq!(received.trace_id(), sent.trace_id());
            assert_ne!(received.span_id(), sent.span_id());
            consumer.end(receive, None);
        });
    }

    #[test]
    fn test_consumer_span_joins_remote_trace() {
        let options = TracingOptions::with_propagator(Arc::new(TraceContextPropagator::new()));
        let consumer = Tracer::new(SpanKind::Consumer, "nats-consumer", &options);
        let mut headers = Headers::new();
        TraceContextPropagator::new()
            .inject_context(&remote_context(), &mut HeaderInjector(&mut headers));

        tracing::subscriber::with_default(otel_subscriber(), || {
            let span = consumer.start("nats", "orders.created", &mut headers);
            assert_eq!(
                span.context().span().span_context().trace_id(),
                TraceId::from_hex(TRACE_ID).unwrap()
            );
            consumer.end(span, None);
        });
    }
}
