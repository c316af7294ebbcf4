//! Request-side relay and HTTP transport.
//!
//! Provides:
//! - Outbound relay: publish a request into any open session and await its response
//! - HTTP/SSE routes (feature: http)

pub mod outbound;

#[cfg(feature = "http")]
pub mod http;

pub use outbound::{OutboundError, OutboundRelay, OutboundRequest};

#[cfg(feature = "http")]
pub use http::{RelayState, RouterHandler, create_relay_router, into_http_request};
