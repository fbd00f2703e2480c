//! Broker, publish and subscribe options.
//!
//! Options are plain structs with builder-style setters. Adapter-specific
//! settings live in the adapter crate; the fields here are the ones every
//! adapter understands.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::handler::ErrorHandler;
use crate::message::Headers;
use crate::telemetry::TracingOptions;

/// TLS material given as file paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// CA bundle used to verify the server.
    pub ca_path: Option<PathBuf>,
    /// Client certificate for mutual TLS.
    pub cert_path: Option<PathBuf>,
    /// Private key matching `cert_path`.
    pub key_path: Option<PathBuf>,
}

/// Process-wide broker configuration.
#[derive(Clone, Default)]
pub struct BrokerOptions {
    /// Server addresses. Adapters substitute their default when empty.
    pub addrs: Vec<String>,
    /// Require an encrypted connection.
    pub secure: bool,
    pub tls: Option<TlsOptions>,
    pub codec: Codec,
    /// Producer/consumer spans are created only when set.
    pub tracing: Option<TracingOptions>,
    /// Receives decode, handler and acknowledge failures.
    pub error_handler: Option<ErrorHandler>,
}

impl BrokerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addrs = addrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set TLS material. Supplying TLS material also enables `secure`.
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self.secure = true;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_tracing(mut self, tracing: TracingOptions) -> Self {
        self.tracing = Some(tracing);
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }
}

impl std::fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("addrs", &self.addrs)
            .field("secure", &self.secure)
            .field("tls", &self.tls)
            .field("codec", &self.codec)
            .field("tracing", &self.tracing)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Headers merged into the outbound message.
    pub headers: Headers,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one header value, keeping earlier values for the same key.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Merge a whole header mapping, appending to existing keys.
    pub fn headers(mut self, headers: Headers) -> Self {
        for (key, values) in headers {
            self.headers.entry(key).or_default().extend(values);
        }
        self
    }
}

/// Where a new stream subscription starts consuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverPosition {
    /// Replay every retained message.
    #[default]
    All,
    /// Only messages published after the subscription was created.
    New,
    /// Start with the most recent message.
    Last,
}

/// Per-subscription options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Acknowledge each message after the handler ran.
    pub auto_ack: bool,
    /// Queue group; members share deliveries.
    pub queue: Option<String>,
    /// Start position for stream subscriptions. Ignored without a stream.
    pub deliver: Option<DeliverPosition>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            queue: None,
            deliver: None,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty names leave the subscription outside any queue group.
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.queue = (!name.trim().is_empty()).then_some(name);
        self
    }

    pub fn auto_ack(mut self, enabled: bool) -> Self {
        self.auto_ack = enabled;
        self
    }

    pub fn deliver_all(self) -> Self {
        self.deliver(DeliverPosition::All)
    }

    pub fn deliver_new(self) -> Self {
        self.deliver(DeliverPosition::New)
    }

    pub fn deliver_last(self) -> Self {
        self.deliver(DeliverPosition::Last)
    }

    pub fn deliver(mut self, position: DeliverPosition) -> Self {
        self.deliver = Some(position);
        self
    }
}
