//! Per-message processing shared by every subscription.

use broker::{
    BrokerError, Codec, ErrorHandler, Handler, Headers, Message, Publication, Tracer,
};
use tracing::{Instrument, Span, debug, warn};

use crate::delivery::Delivery;
use crate::headers::from_header_map;

/// Messaging system name recorded on spans.
pub const MESSAGING_SYSTEM: &str = "nats";

/// Runs the handler for each delivery of one subscription.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    pub(crate) handler: Handler,
    pub(crate) codec: Codec,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) auto_ack: bool,
    pub(crate) tracer: Option<Tracer>,
}

impl Dispatcher {
    /// Decode, handle and acknowledge one message.
    ///
    /// A message that fails to decode is neither handled nor acknowledged.
    /// A handler failure still acknowledges when `auto_ack` is set.
    pub(crate) async fn dispatch<D: Delivery>(&self, delivery: &D) {
        let topic = delivery.subject();
        let mut headers = delivery.headers().map(from_header_map).unwrap_or_default();
        let span = self
            .tracer
            .as_ref()
            .map(|tracer| tracer.start(MESSAGING_SYSTEM, topic, &mut headers));
        let payload = delivery.payload();

        let outcome = self
            .handler
            .handle(self.codec, topic, headers.clone(), payload.clone())
            .instrument(span.clone().unwrap_or_else(Span::none))
            .await;

        let mut failure = None;
        if let Err(err) = outcome {
            self.report(topic, &headers, &payload, &err);
            if err.is_decode() {
                self.end(span, Some(&err));
                return;
            }
            failure = Some(err);
        }

        if self.auto_ack {
            match delivery.acknowledge().await {
                Ok(()) => debug!(topic, "message acknowledged"),
                Err(err) => {
                    self.report(topic, &headers, &payload, &err);
                    failure.get_or_insert(err);
                }
            }
        }

        self.end(span, failure.as_ref());
    }

    fn report(&self, topic: &str, headers: &Headers, payload: &bytes::Bytes, err: &BrokerError) {
        warn!(topic, error = %err, "message processing failed");
        if let Some(error_handler) = &self.error_handler {
            let publication =
                Publication::new(topic, Message::new(headers.clone(), payload.clone()));
            error_handler(&publication, err);
        }
    }

    fn end(&self, span: Option<Span>, err: Option<&BrokerError>) {
        if let (Some(tracer), Some(span)) = (&self.tracer, span) {
            tracer.end(span, err);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("codec", &self.codec)
            .field("auto_ack", &self.auto_ack)
            .field("tracing", &self.tracer.is_some())
            .finish_non_exhaustive()
    }
}
