//! # Relay Client
//!
//! Client engine for the racing relay server.
//!
//! A session runs over two channels:
//! - a **command channel**: newline-delimited JSON over TLS, rate limited and lossless
//! - a **datagram channel**: AES-256-CBC encrypted JSON over UDP for position and input
//!   updates, rate limited and lossy
//!
//! On top of those the engine tracks the connection/authentication state, the current
//! room with its host and roster, and reconnects with bounded backoff when the command
//! channel drops.
//!
//! ## Example
//! ```no_run
//! use relay_client::{ClientEvent, Credentials, NetworkConfig, RelayClient};
//!
//! # async fn run() -> relay_client::Result<()> {
//! let client = RelayClient::new(NetworkConfig::default())?;
//! let mut events = client.subscribe();
//!
//! client.connect().await?;
//! client.authenticate(Credentials::new("Bob", "secret"))?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let ClientEvent::AuthChanged { authenticated: true, .. } = event {
//!         client.list_rooms()?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Layout
//! - [`core`]: line framing and datagram packet framing
//! - [`protocol`]: messages, codec, dispatcher, session and room state (no I/O)
//! - [`transport`]: TLS command channel, UDP datagram channel, retry policy
//! - [`service`]: the [`RelayClient`] engine
//! - [`utils`]: crypto, metrics, logging, timeouts

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{NetworkConfig, TrustMode};
pub use error::{ConnectError, ProtocolError, Result};
pub use protocol::message::{
    ClientEvent, Credentials, ErrorKind, HostId, Password, Quat, RoomInfo, Vec3,
};
pub use protocol::session::{SessionSnapshot, SessionState};
pub use service::client::RelayClient;
pub use transport::Connector;
pub use utils::logging::init_logging;
