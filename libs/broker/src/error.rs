//! Error types for broker operations.
//!
//! Setup-time failures (`connect`, `publish`, `subscribe`) are returned to the
//! caller. Per-message failures (decode, handler, acknowledge) never reach a
//! caller; adapters route them to the configured error handler and log them.

use thiserror::Error;

/// Top-level error type shared by broker adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Operation attempted before `connect` or after `disconnect`.
    #[error("not connected")]
    NotConnected,

    /// The underlying connect call failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stream lookup, creation or update failed.
    #[error("stream setup failed for '{stream}': {message}")]
    StreamSetup { stream: String, message: String },

    /// Outbound payload could not be serialized.
    #[error("encode failed ({codec}): {message}")]
    Encode { codec: &'static str, message: String },

    /// Inbound payload could not be decoded into the expected type.
    #[error("decode failed ({codec}): {message}")]
    Decode { codec: &'static str, message: String },

    /// The user callback returned an error.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Post-handler acknowledgement failed.
    #[error("acknowledge failed: {0}")]
    Acknowledge(String),

    /// The transport rejected an outbound message.
    #[error("publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    /// The transport rejected a subscription.
    #[error("subscribe to '{topic}' failed: {message}")]
    Subscribe { topic: String, message: String },

    /// Graceful drain reported an error or timed out.
    #[error("drain failed: {0}")]
    Drain(String),

    /// Invalid or conflicting configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed when the caller retries (transport-level failures).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::Publish { .. }
                | BrokerError::Subscribe { .. }
        )
    }

    /// Returns true if the operation ran without a connection.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, BrokerError::NotConnected)
    }

    /// Returns true if an inbound payload failed to decode.
    pub fn is_decode(&self) -> bool {
        matches!(self, BrokerError::Decode { .. })
    }
}

/// Shorthand result alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
