//! Wire protocol for relayed messages and responses.
//!
//! Both shapes travel as JSON text over the broker:
//! - `requests:{session}` carries [`RelayedMessage`]
//! - `responses:{session}:{request}` carries [`RelayedResponse`]

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::traits::SessionId;

/// Topic carrying relayed messages for a session.
#[must_use]
pub fn request_topic(session_id: &SessionId) -> String {
    format!("requests:{session_id}")
}

/// Topic carrying the response to one relayed message.
#[must_use]
pub fn response_topic(session_id: &SessionId, request_id: &str) -> String {
    format!("responses:{session_id}:{request_id}")
}

/// Header value: either a single string or a repeated header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    /// Iterate over every value carried by this header.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let slice = match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::Multiple(values) => values.as_slice(),
        };
        slice.iter().map(String::as_str)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Single(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        Self::Multiple(values)
    }
}

/// Header map keyed by header name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Malformed payload received from the broker.
#[derive(Debug, Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// One unit of work sent from a detached request into an open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedMessage {
    /// Correlates the eventual response. Generated by the sender.
    pub request_id: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: Headers,
}

impl RelayedMessage {
    /// Create a message with a freshly generated request id.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        headers: Headers,
        body: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            url: url.into(),
            method: method.into(),
            body: body.into(),
            headers,
        }
    }

    /// Serialize for publishing.
    ///
    /// # Errors
    /// Returns error if JSON serialization fails.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Decode a payload received from the broker.
    ///
    /// # Errors
    /// Returns [`DecodeError`] if the payload is not a relayed message.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Correlated reply to a [`RelayedMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedResponse {
    pub status: u16,
    #[serde(default)]
    pub body: String,
}

impl RelayedResponse {
    /// Create a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Serialize for publishing.
    ///
    /// # Errors
    /// Returns error if JSON serialization fails.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Decode a payload received from the broker.
    ///
    /// # Errors
    /// Returns [`DecodeError`] if the payload is not a relayed response.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
