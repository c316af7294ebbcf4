//! Session lifecycle and the stream-side relay.
//!
//! Provides:
//! - `SessionRegistry` - Per-process map of open sessions
//! - `LifecycleSupervisor` / `CloseSignal` - Deadline, disconnect and close triggers
//! - `InboundRelay` - Replays relayed messages into a session's handler

pub mod inbound;
pub mod lifecycle;
pub mod registry;

pub use inbound::{HandlerFactory, InboundRelay, OpenSession, RelayError, SessionContext};
pub use lifecycle::{CloseReason, CloseSignal, LifecycleSupervisor};
pub use registry::{RegistryError, SessionEntry, SessionRegistry};
