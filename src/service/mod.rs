//! # Service Layer
//!
//! The caller-facing engine: [`client::RelayClient`] wires the session state machine to
//! the TLS and datagram transports and publishes [`ClientEvent`](crate::protocol::message::ClientEvent)s.

pub mod client;
