//! # Error Types
//!
//! Error handling for the relay client engine.
//!
//! This module defines every failure the engine can report, from socket-level
//! connect failures up to server data-integrity problems.
//!
//! ## Error Categories
//! - **Connect Errors**: TCP/TLS establishment and welcome-line failures (retried by the
//!   reconnection policy before they are surfaced)
//! - **Parse Errors**: malformed JSON or pipe lines, unknown commands (logged, message dropped)
//! - **Auth Errors**: `AUTH_FAILED` from the server (surfaced immediately)
//! - **Crypto Errors**: datagram decrypt failures (recovered through the plaintext fallback)
//! - **Protocol Errors**: malformed welcome, missing spawn data (surfaced to the caller)
//! - **Transport Errors**: read timeouts, closed sockets
//!
//! Nothing in this crate panics across the public boundary; every failure is either a
//! `Result` return or a [`ClientEvent`](crate::protocol::message::ClientEvent).
//!
//! ## Example Usage
//! ```rust
//! use relay_client::error::{ConnectError, ProtocolError, Result};
//! use tracing::error;
//!
//! fn check_welcome(line: &str) -> Result<&str> {
//!     line.strip_prefix("CONNECTED|")
//!         .filter(|id| !id.is_empty())
//!         .ok_or_else(|| ConnectError::ProtocolViolation(line.to_string()).into())
//! }
//!
//! if let Err(e) = check_welcome("HELLO") {
//!     error!(error = %e, "Bad welcome line");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Welcome / handshake errors
    pub const ERR_WELCOME_MISSING: &str = "Server closed the connection before the welcome line";
    pub const ERR_WELCOME_MALFORMED: &str = "Malformed welcome line";
    pub const ERR_PINNED_MISMATCH: &str = "Pinned certificate thumbprint mismatch";

    /// Codec errors
    pub const ERR_EMPTY_LINE: &str = "Empty line";
    pub const ERR_MISSING_COMMAND: &str = "Message has no command field";
    pub const ERR_MALFORMED_COMMAND: &str = "Malformed command name";
    pub const ERR_LINE_TOO_LONG: &str = "Line exceeds maximum length";

    /// Crypto errors
    pub const ERR_LENGTH_MISMATCH: &str = "Declared datagram length does not match buffer";
    pub const ERR_DECRYPTION_FAILED: &str = "Datagram decryption failed";

    /// Game errors
    pub const ERR_SPAWN_MISSING: &str = "spawn position missing";
    pub const ERR_NOT_IN_ROOM: &str = "Not in a room";
    pub const ERR_NOT_AUTHENTICATED: &str = "Not authenticated";
}

/// Failures while establishing the command channel.
///
/// None of these are retried by the transport itself; see
/// [`transport::reconnect`](crate::transport::reconnect).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Connection attempt timed out")]
    Timeout,

    #[error("Connection refused")]
    Refused,

    #[error("Server certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("Protocol violation during connect: {0}")]
    ProtocolViolation(String),

    #[error("I/O error during connect: {0}")]
    Io(String),
}

impl ConnectError {
    /// Certificate and protocol failures will not fix themselves on a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectError::CertificateRejected(_) | ConnectError::ProtocolViolation(_)
        )
    }
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused,
            io::ErrorKind::TimedOut => ConnectError::Timeout,
            _ => ConnectError::Io(e.to_string()),
        }
    }
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation not valid in state {0}")]
    InvalidState(String),

    #[error("Only the room host can start the game")]
    NotHost,

    #[error("Engine is not running")]
    EngineStopped,
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
