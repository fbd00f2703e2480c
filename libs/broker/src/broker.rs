//! The broker lifecycle contract.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::error::BrokerResult;
use crate::handler::Handler;
use crate::options::{BrokerOptions, PublishOptions, SubscribeOptions};
use crate::subscriber::Subscriber;

/// A message broker connection.
///
/// Lifecycle: `init` (optional), `connect`, then any number of `publish` and
/// `subscribe` calls, then `disconnect`. Every method takes `&self`; adapters
/// guard their state internally so one broker can be shared behind an `Arc`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Adapter name, e.g. `"nats"`.
    fn name(&self) -> &'static str;

    /// First configured server address.
    async fn address(&self) -> String;

    /// Snapshot of the current options.
    async fn options(&self) -> BrokerOptions;

    /// Prepare tracers and other resources that do not need a connection.
    async fn init(&self) -> BrokerResult<()>;

    /// Open the connection. Calling it again while connected is a no-op.
    async fn connect(&self) -> BrokerResult<()>;

    /// Stop every subscription and close the connection.
    async fn disconnect(&self) -> BrokerResult<()>;

    /// Publish an already encoded payload.
    async fn publish_raw(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> BrokerResult<()>;

    /// Register `handler` for messages on `topic`.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Handler,
        options: SubscribeOptions,
    ) -> BrokerResult<Arc<dyn Subscriber>>;
}

/// Typed publishing on top of [`Broker::publish_raw`].
#[async_trait]
pub trait BrokerExt: Broker {
    /// Encode `message` with the broker codec and publish it.
    async fn publish<T>(&self, topic: &str, message: &T, options: PublishOptions) -> BrokerResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let codec = self.options().await.codec;
        let payload = codec.marshal(message)?;
        self.publish_raw(topic, Bytes::from(payload), options).await
    }
}

impl<B: Broker + ?Sized> BrokerExt for B {}
