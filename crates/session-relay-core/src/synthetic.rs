//! Synthetic requests for replaying relayed messages into a live handler.
//!
//! A [`SyntheticRequest`] is a structural stand-in for an inbound request:
//! method, url, headers and a body stream that yields the buffered body
//! followed by end-of-stream. No socket is involved.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::protocol::{HeaderValue, Headers, RelayedMessage, RelayedResponse};

/// Status recorded when a handler never writes one.
pub const DEFAULT_STATUS: u16 = 200;

/// Inbound-request-shaped value rebuilt from buffered fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticRequest {
    method: String,
    url: String,
    headers: Headers,
    body: Option<Bytes>,
}

impl SyntheticRequest {
    /// Build a request from its parts.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        headers: Headers,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers,
            body,
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Look up a header by name, ignoring ASCII case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Take the buffered body. Subsequent calls return an empty body,
    /// as a consumed connection would.
    pub fn take_body(&mut self) -> Bytes {
        self.body.take().unwrap_or_default()
    }

    /// Body as a byte stream: the buffered body (if any) then end-of-stream.
    pub fn body_stream(&mut self) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
        let chunk = self.body.take().filter(|b| !b.is_empty());
        stream::iter(chunk.map(Ok)).boxed()
    }

    /// Split into method, url, headers and body.
    #[must_use]
    pub fn into_parts(self) -> (String, String, Headers, Bytes) {
        (
            self.method,
            self.url,
            self.headers,
            self.body.unwrap_or_default(),
        )
    }
}

impl From<RelayedMessage> for SyntheticRequest {
    fn from(msg: RelayedMessage) -> Self {
        let body = (!msg.body.is_empty()).then(|| Bytes::from(msg.body));
        Self::new(msg.method, msg.url, msg.headers, body)
    }
}

/// Response sink handed to a handler for the relayed path.
///
/// Only the last status and the last terminal body are kept.
#[derive(Debug, Default)]
pub struct ResponseSink {
    status: Option<u16>,
    body: Option<Bytes>,
}

impl ResponseSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the response status.
    pub fn write_head(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// Record the terminal body.
    pub fn end(&mut self, body: impl Into<Bytes>) {
        self.body = Some(body.into());
    }

    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    #[must_use]
    pub const fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Whether the handler wrote a terminal body.
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        self.body.is_some()
    }

    /// Convert what was recorded into a wire response.
    #[must_use]
    pub fn into_response(self) -> RelayedResponse {
        let body = self
            .body
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        RelayedResponse::new(self.status.unwrap_or(DEFAULT_STATUS), body)
    }
}
