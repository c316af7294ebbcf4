//! Core primitives for relaying requests into long-lived sessions.
//!
//! This crate provides the building blocks shared by both sides of a relay:
//! - `Broker` - Publish/subscribe abstraction (in-memory and Redis)
//! - `RelayedMessage` / `RelayedResponse` - Wire protocol and topic names
//! - `SyntheticRequest` / `ResponseSink` - Replaying buffered requests into a handler
//! - `ChannelStream` - Channel-backed streamed connection
//! - `RelayConfig` - Environment configuration
//! - Protocol handler and stream traits

pub mod broker;
pub mod config;
pub mod protocol;
pub mod stream;
pub mod synthetic;
pub mod traits;

pub use broker::{Broker, BrokerError, MemoryBroker, Subscription};
pub use config::RelayConfig;
pub use protocol::{HeaderValue, Headers, RelayedMessage, RelayedResponse};
pub use stream::{ChannelStream, StreamFrame};
pub use synthetic::{ResponseSink, SyntheticRequest};
pub use traits::{HandlerError, ProtocolHandler, SessionId, StreamClosed, StreamConnection};
