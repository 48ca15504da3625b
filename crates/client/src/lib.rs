//! Network-facing leaves of the job tracker.
//!
//! Provides the REST API wrapper, the streaming wire protocol, a
//! WebSocket connector, the linear reconnect policy, the streaming
//! [`channel::TransportChannel`] and the status [`poller`].

pub mod api;
pub mod channel;
pub mod client;
pub mod poller;
pub mod protocol;
pub mod reconnect;
