//! Inbound messages as seen by the dispatcher.

use std::future::Future;

use async_nats::HeaderMap;
use async_nats::jetstream;
use broker::{BrokerError, BrokerResult};
use bytes::Bytes;

/// One delivered message, core or JetStream.
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;

    fn headers(&self) -> Option<&HeaderMap>;

    fn payload(&self) -> Bytes;

    /// Acknowledge processing to the server.
    fn acknowledge(&self) -> impl Future<Output = BrokerResult<()>> + Send;
}

/// Core messages carry no acknowledgement; acknowledging is a no-op.
impl Delivery for async_nats::Message {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    async fn acknowledge(&self) -> BrokerResult<()> {
        Ok(())
    }
}

impl Delivery for jetstream::Message {
    fn subject(&self) -> &str {
        &self.message.subject
    }

    fn headers(&self) -> Option<&HeaderMap> {
        self.message.headers.as_ref()
    }

    fn payload(&self) -> Bytes {
        self.message.payload.clone()
    }

    async fn acknowledge(&self) -> BrokerResult<()> {
        self.ack()
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}
