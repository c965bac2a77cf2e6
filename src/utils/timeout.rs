//! Async timeout wrappers and the default durations used by the transports.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default per-call timeout for line reads and writes (detects half-open connections)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on TCP connect + TLS handshake + welcome line
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle interval after which a keepalive PING is queued
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Grace period for the best-effort BYE on disconnect
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Run `fut` with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
