//! # herald-dispatch
//!
//! Outbound dispatch and connection lifecycle for messaging instances.
//!
//! - [`connection::InstanceManager`] runs one connection state machine per instance
//! - [`queue::DispatchQueue`] paces every send through a single consumer loop
//! - [`poller::ScheduledPoller`] promotes due scheduled messages into the queue
//! - [`notifier::StatusNotifier`] reports outcomes to an admin recipient
//! - [`service::MessagingService`] wires them together over injected stores

pub mod broadcast;
pub mod connection;
pub mod mock;
pub mod notifier;
pub mod outcome;
pub mod poller;
pub mod queue;
pub mod rate_limit;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use broadcast::{next_event, Broadcaster};
pub use connection::InstanceManager;
pub use poller::{PollerHandle, ScheduledPoller};
pub use queue::{DispatchQueue, MessageSender, PendingDispatch, SendResult};
pub use rate_limit::RateLimiter;
pub use service::{MessagingService, SendRequest, ServiceConfig, ServiceDeps, ServiceError};
