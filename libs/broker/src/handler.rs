//! Subscription callbacks.
//!
//! A [`Handler`] decodes one delivery and runs the user callback on it. The
//! body type of a typed handler plays the role of the "binder": it names the
//! value the payload is decoded into. A raw handler skips decoding and hands
//! over the payload bytes.
//!
//! Decode failures come back as [`BrokerError::Decode`] and callback failures
//! as [`BrokerError::Handler`], so adapters can tell whether the user code ran.

use std::{future::Future, marker::PhantomData, sync::Arc};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::error::{BrokerError, BrokerResult};
use crate::message::{Headers, Message, Publication};

/// Boxed error returned by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result returned by user callbacks.
pub type HandlerResult = Result<(), BoxError>;

/// Callback for per-message failures that have no caller to return to.
///
/// Receives the raw delivery and the decode, handler or acknowledge error.
pub type ErrorHandler = Arc<dyn Fn(&Publication<Bytes>, &BrokerError) + Send + Sync>;

trait Dispatch: Send + Sync {
    fn dispatch(
        &self,
        codec: Codec,
        topic: String,
        headers: Headers,
        payload: Bytes,
    ) -> BoxFuture<'static, BrokerResult<()>>;
}

struct Typed<T, F> {
    callback: F,
    _body: PhantomData<fn() -> T>,
}

impl<T, F, Fut> Dispatch for Typed<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Publication<T>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn dispatch(
        &self,
        codec: Codec,
        topic: String,
        headers: Headers,
        payload: Bytes,
    ) -> BoxFuture<'static, BrokerResult<()>> {
        let body: T = match codec.unmarshal(&payload) {
            Ok(body) => body,
            Err(err) => return futures::future::ready(Err(err)).boxed(),
        };
        let call = (self.callback)(Publication::new(topic, Message::new(headers, body)));
        async move { call.await.map_err(|e| BrokerError::Handler(e.to_string())) }.boxed()
    }
}

struct Raw<F> {
    callback: F,
}

impl<F, Fut> Dispatch for Raw<F>
where
    F: Fn(Publication<Bytes>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn dispatch(
        &self,
        _codec: Codec,
        topic: String,
        headers: Headers,
        payload: Bytes,
    ) -> BoxFuture<'static, BrokerResult<()>> {
        let call = (self.callback)(Publication::new(topic, Message::new(headers, payload)));
        async move { call.await.map_err(|e| BrokerError::Handler(e.to_string())) }.boxed()
    }
}

/// Type-erased subscription callback.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<dyn Dispatch>,
}

impl Handler {
    /// Handler that decodes each payload into `T` with the broker codec.
    pub fn typed<T, F, Fut>(callback: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Publication<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            inner: Arc::new(Typed {
                callback,
                _body: PhantomData,
            }),
        }
    }

    /// Handler that receives the payload bytes as-is.
    pub fn raw<F, Fut>(callback: F) -> Self
    where
        F: Fn(Publication<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            inner: Arc::new(Raw { callback }),
        }
    }

    /// Decode `payload` and run the callback.
    pub async fn handle(
        &self,
        codec: Codec,
        topic: &str,
        headers: Headers,
        payload: Bytes,
    ) -> BrokerResult<()> {
        self.inner
            .dispatch(codec, topic.to_owned(), headers, payload)
            .await
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}
