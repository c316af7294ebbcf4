//! Core traits for protocol handlers and streamed connections.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::synthetic::{ResponseSink, SyntheticRequest};

/// Session identifier.
///
/// Opaque token minted when a stream opens. Random enough to avoid
/// collisions, but not a credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh session identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Protocol handler error.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol handler bound to one live streamed connection.
///
/// For the relayed path the handler is driven with a [`SyntheticRequest`]
/// and must record its status and body on the [`ResponseSink`] before
/// returning.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Handle one inbound request.
    async fn handle(
        &self,
        request: SyntheticRequest,
        sink: &mut ResponseSink,
    ) -> Result<(), HandlerError>;
}

/// Returned when writing to a stream that has already been finalized
/// or whose client went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Stream closed")]
pub struct StreamClosed;

/// Long-lived streamed connection held open by a client.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    /// Emit raw bytes to the client.
    ///
    /// # Errors
    /// Returns [`StreamClosed`] if the stream was finalized or dropped.
    async fn send(&self, data: Bytes) -> Result<(), StreamClosed>;

    /// Resolves once the client has disconnected.
    async fn disconnected(&self);

    /// Finalize the stream with a terminal status. Only the first call
    /// has any effect.
    fn finish(&self, status: u16);

    /// Whether the stream has been finalized or dropped.
    fn is_closed(&self) -> bool;
}
