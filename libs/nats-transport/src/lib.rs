//! # nats-transport
//!
//! Message server over [`nats_broker::NatsBroker`]: register typed
//! subscribers, then start and stop them together.
//!
//! ```ignore
//! trace::Config::parse(&SystemEnv, "info")?.init()?;
//!
//! let server = Server::builder()
//!     .address(["127.0.0.1:4222"])
//!     .jetstream(StreamConfig::new("orders", ["orders.*"]))
//!     .build()?;
//! server
//!     .register_subscriber("orders.created", on_order, SubscribeOptions::new())
//!     .await?;
//! server.start().await?;
//! ```

pub mod server;
pub mod trace;

pub use server::{Server, ServerBuilder};
