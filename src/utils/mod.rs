//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, metrics and timing.
//!
//! ## Components
//! - **Crypto**: AES-256-CBC session cipher for the datagram channel
//! - **Logging**: `tracing-subscriber` setup driven by [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: per-engine atomic counters
//! - **Time**: wall-clock timestamps for wire fields
//! - **Timeout**: async timeout wrappers
//!
//! ## Security
//! - Session keys are derived, never transmitted
//! - Key material is zeroed on drop (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;

pub use crypto::{CryptoContext, SessionCipher};
pub use metrics::{Metrics, MetricsSnapshot};
