//! Gateway implementations.
//!
//! The in-memory gateway is always available. The HTTP gateway and its SSE
//! change relay are behind the `rest` feature.

mod inmemory;
#[cfg(feature = "rest")]
mod rest;
#[cfg(feature = "rest")]
mod sse;

pub use inmemory::{GatewayOp, InMemoryGateway};
#[cfg(feature = "rest")]
pub use rest::RestGateway;
#[cfg(feature = "rest")]
pub use sse::SseChangeFeed;
