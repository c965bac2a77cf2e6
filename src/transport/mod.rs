//! # Transport Layer
//!
//! Network channels to the relay.
//!
//! ## Components
//! - **TLS**: newline-framed command channel over TLS with configurable trust
//! - **Datagram**: length-prefixed, optionally AES-encrypted JSON over UDP
//! - **Reconnect**: bounded exponential backoff around connection attempts
//!
//! The command channel is reached through the [`Connector`] trait so the engine can be
//! driven over any duplex stream.

pub mod datagram;
pub mod reconnect;
pub mod tls;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ClientConfig;
use crate::error::ConnectError;
use crate::transport::tls::RawConnection;

/// Opens command-channel connections and reads the welcome line.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// One connection attempt. Retries are the caller's business.
    fn open(
        &self,
        config: ClientConfig,
    ) -> BoxFuture<'static, std::result::Result<RawConnection<Self::Stream>, ConnectError>>;
}
