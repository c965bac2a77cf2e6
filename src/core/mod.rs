//! # Core Framing
//!
//! Byte-level framing shared by the two transports.
//!
//! ## Components
//! - **Codec**: newline-delimited UTF-8 framing for the command channel
//! - **Packet**: length-prefixed datagram framing for the UDP channel
//!
//! ## Wire Formats
//! ```text
//! command channel:  <utf-8 text>\n
//! datagram channel: [Length(4, little-endian)] [Body(N)]
//! ```
//!
//! ## Safety
//! - Command lines longer than the configured maximum are discarded, not buffered
//! - Datagram length prefixes are validated against the received size before use

pub mod codec;
pub mod packet;
