//! # Reconnection Policy
//!
//! Bounded exponential backoff around single connection attempts.
//!
//! After the `n`th failed attempt (zero-based) the next attempt waits
//! `min(2^n * base_delay, max_delay)`. After `max_attempts` failures, or on the first
//! fatal failure (certificate or protocol), the caller gets one [`RetryExhausted`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ConnectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Delay after the zero-based `attempt` failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Progress of one retry sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    /// Attempts made so far
    pub attempts: u32,
}

impl RetryState {
    /// Record a failure; returns the wait before the next attempt, or `None` when done.
    pub fn on_failure(&mut self, policy: &RetryPolicy, error: &ConnectError) -> Option<Duration> {
        let failed = self.attempts;
        self.attempts += 1;
        if error.is_fatal() || self.attempts >= policy.max_attempts {
            return None;
        }
        Some(policy.delay_for(failed))
    }
}

/// Terminal result of a retry sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: ConnectError,
    /// Stopped by cancellation rather than by failures
    pub cancelled: bool,
}

/// Run `attempt` until it succeeds, the policy gives up, or `cancel` fires.
///
/// `attempt` receives the zero-based attempt number.
pub async fn connect_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> std::result::Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, ConnectError>>,
{
    let mut state = RetryState::default();

    loop {
        let n = state.attempts;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryExhausted {
                    attempts: state.attempts,
                    last_error: ConnectError::Io("cancelled".into()),
                    cancelled: true,
                });
            }
            result = attempt(n) => result,
        };

        let error = match result {
            Ok(value) => {
                if n > 0 {
                    info!(attempt = n + 1, "Connected after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        match state.on_failure(policy, &error) {
            None => {
                warn!(attempts = state.attempts, error = %error, fatal = error.is_fatal(), "Giving up on connection");
                return Err(RetryExhausted {
                    attempts: state.attempts,
                    last_error: error,
                    cancelled: false,
                });
            }
            Some(delay) => {
                debug!(attempt = n + 1, error = %error, delay_ms = delay.as_millis() as u64, "Connection attempt failed, backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(RetryExhausted {
                            attempts: state.attempts,
                            last_error: error,
                            cancelled: true,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
