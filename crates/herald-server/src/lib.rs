//! # herald-server
//!
//! Observer and control surface for the messaging service: a WebSocket that
//! streams system events and answers RPC calls, a health probe, and the
//! callback route for the HTTP bridge transport.

pub mod bridge;
pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod rpc;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

pub use bridge::{BridgeTransport, BridgeTransportFactory, DeliveryError};
pub use server::{start, ServerConfig, ServerHandle};
