//! Messages and publications exchanged with handlers.

use std::collections::HashMap;

/// Header key to ordered header values.
pub type Headers = HashMap<String, Vec<String>>;

/// A message body together with its headers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message<T> {
    pub headers: Headers,
    pub body: T,
}

impl<T> Message<T> {
    pub fn new(headers: Headers, body: T) -> Self {
        Self { headers, body }
    }
}

/// One delivery handed to a subscription handler.
///
/// Lives for the duration of a single handler call.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication<T> {
    topic: String,
    message: Message<T>,
}

impl<T> Publication<T> {
    pub fn new(topic: impl Into<String>, message: Message<T>) -> Self {
        Self {
            topic: topic.into(),
            message,
        }
    }

    /// Subject the message was delivered on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &Message<T> {
        &self.message
    }

    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    /// First value stored under `key`, if any.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.message
            .headers
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn body(&self) -> &T {
        &self.message.body
    }

    pub fn into_message(self) -> Message<T> {
        self.message
    }
}
