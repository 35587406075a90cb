//! Delivered message type.

use bytes::Bytes;

use crate::headers::HeaderMap;

/// A message delivered to a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: String,
    /// Subscription id the server routed the message to.
    pub sid: u64,
    /// Reply subject, when the publisher expects a response.
    pub reply: Option<String>,
    /// Decoded headers, when the delivery carried a header block.
    pub headers: Option<HeaderMap>,
    /// Message body.
    pub payload: Bytes,
}

impl Message {
    /// Status code from the header status line, if any.
    ///
    /// Codes of 300 and above are protocol-level conditions interpreted by
    /// the request and consumer layers, not application data.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.headers.as_ref().and_then(HeaderMap::status)
    }

    /// Description accompanying the status code.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.headers.as_ref().and_then(HeaderMap::description)
    }

    /// First value of the named header.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| headers.get(key))
    }
}
