//! Wall-clock helpers for timestamp fields carried on the wire.
//!
//! Rate limiting and timeouts use `Instant`; these helpers are only for values the
//! server sees (`PING.timestamp`, `INPUT.input.timestamp`).

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, or 0 if the clock is before the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
