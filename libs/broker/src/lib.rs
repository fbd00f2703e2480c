//! # broker
//!
//! Transport-agnostic contract shared by message broker adapters.
//!
//! This library provides:
//! - **`Broker` trait** with the `connect / publish / subscribe` lifecycle a
//!   host application drives, plus `BrokerExt` for typed publishing.
//! - **Typed options** for the broker itself, for each publish and for each
//!   subscription.
//! - **Codec registry** (`json`, `yaml`) selected by name.
//! - **Handlers and publications**: typed or raw message callbacks and the
//!   value handed to them per delivery.
//! - **Subscriber registry** keyed by topic, safe for concurrent use.
//! - **Span helpers** for producer/consumer spans with trace context carried
//!   in message headers.
//!
//! Adapters (see `nats-broker`) implement [`Broker`] and reuse the rest.

pub mod broker;
pub mod codec;
pub mod error;
pub mod handler;
pub mod message;
pub mod options;
pub mod subscriber;
pub mod telemetry;

// Re-export key types for convenient access
pub use broker::{Broker, BrokerExt};
pub use codec::Codec;
pub use error::{BrokerError, BrokerResult};
pub use handler::{BoxError, ErrorHandler, Handler, HandlerResult};
pub use message::{Headers, Message, Publication};
pub use options::{
    BrokerOptions, DeliverPosition, PublishOptions, SubscribeOptions, TlsOptions,
};
pub use subscriber::{Subscriber, SubscriberSyncMap};
pub use telemetry::{
    HeaderExtractor, HeaderInjector, Propagator, SpanKind, Tracer, TracingOptions,
};
