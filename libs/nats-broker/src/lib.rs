//! # nats-broker
//!
//! NATS adapter for the [`broker`] contract.
//!
//! Without a stream definition the broker uses core NATS publish/subscribe.
//! With one, it makes sure the stream exists when connecting, publishes
//! through JetStream and awaits the publish ack, and consumes through pull
//! consumers with explicit acknowledgement.
//!
//! ```ignore
//! let broker = NatsBroker::new(
//!     BrokerOptions::new().with_addrs(["127.0.0.1:4222"]),
//!     NatsOptions::new().with_jetstream("orders", ["orders.*"]).with_drain(),
//! )?;
//! broker.init().await?;
//! broker.connect().await?;
//! broker
//!     .subscribe("orders.*", Handler::typed(on_order), SubscribeOptions::new().queue("billing"))
//!     .await?;
//! ```

pub mod adapter;
mod connect;
pub mod delivery;
mod dispatch;
pub mod env;
pub mod events;
pub mod headers;
pub mod options;
pub mod subscriber;

pub use adapter::{CONSUMER_TRACER, NatsBroker, PRODUCER_TRACER};
pub use delivery::Delivery;
pub use dispatch::MESSAGING_SYSTEM;
pub use env::{MapEnv, ReadEnv, SystemEnv};
pub use events::{ConnectionEvent, EventChannel};
pub use options::{
    ClientOptions, DEFAULT_ADDRESS, DEFAULT_DRAIN_TIMEOUT, NatsOptions, Retention, SecurityMode,
    Storage, StreamConfig,
};
pub use subscriber::NatsSubscriber;
