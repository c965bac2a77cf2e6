//! # Protocol Layer
//!
//! Everything between raw lines/datagrams and the caller-facing engine.
//!
//! ## Components
//! - **Message**: typed commands, datagram payloads, inbound events and client events
//! - **Codec**: normalizes JSON, pipe-delimited and bare relay lines into one event type
//! - **Dispatcher**: per-channel outbound queues with minimum send intervals
//! - **Room**: current room, host resolution and roster bookkeeping
//! - **Session**: connection/auth state machine that owns the pieces above
//!
//! Nothing in this module performs I/O; time is always passed in.

pub mod codec;
pub mod dispatcher;
pub mod message;
pub mod room;
pub mod session;

#[cfg(test)]
mod tests;
