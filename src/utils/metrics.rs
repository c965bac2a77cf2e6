//! Observability and Metrics
//!
//! Counters for one engine instance. The I/O tasks and the state mutator share a single
//! `Arc<Metrics>`; there is no process-wide instance, so several simulated clients in one
//! process keep separate numbers.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for one relay client
#[derive(Debug)]
pub struct Metrics {
    /// Successful command-channel connections (initial + reconnects)
    pub connections_total: AtomicU64,
    /// Connection attempts that failed
    pub connect_failures: AtomicU64,
    /// Reconnect attempts made by the retry policy
    pub reconnect_attempts: AtomicU64,
    /// Lines written to the command channel
    pub commands_sent: AtomicU64,
    /// Lines read from the command channel
    pub lines_received: AtomicU64,
    /// Datagrams written to the UDP socket
    pub datagrams_sent: AtomicU64,
    /// Datagrams read from the UDP socket
    pub datagrams_received: AtomicU64,
    /// Datagrams rejected by the rate limiter
    pub datagrams_rate_limited: AtomicU64,
    /// Datagrams that failed length validation or decryption
    pub decrypt_failures: AtomicU64,
    /// Datagrams accepted through the plaintext fallback
    pub plaintext_fallbacks: AtomicU64,
    /// Datagrams dropped as undecodable
    pub datagrams_dropped: AtomicU64,
    /// Inbound lines that could not be parsed
    pub parse_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            lines_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_rate_limited: AtomicU64::new(0),
            decrypt_failures: AtomicU64::new(0),
            plaintext_fallbacks: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_sent(&self) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_rate_limited(&self) {
        self.datagrams_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn plaintext_fallback(&self) {
        self.plaintext_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_rate_limited: self.datagrams_rate_limited.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            plaintext_fallbacks: self.plaintext_fallbacks.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connect_failures = snapshot.connect_failures,
            reconnect_attempts = snapshot.reconnect_attempts,
            commands_sent = snapshot.commands_sent,
            lines_received = snapshot.lines_received,
            datagrams_sent = snapshot.datagrams_sent,
            datagrams_received = snapshot.datagrams_received,
            datagrams_rate_limited = snapshot.datagrams_rate_limited,
            decrypt_failures = snapshot.decrypt_failures,
            plaintext_fallbacks = snapshot.plaintext_fallbacks,
            datagrams_dropped = snapshot.datagrams_dropped,
            parse_errors = snapshot.parse_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Relay client metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connect_failures: u64,
    pub reconnect_attempts: u64,
    pub commands_sent: u64,
    pub lines_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub datagrams_rate_limited: u64,
    pub decrypt_failures: u64,
    pub plaintext_fallbacks: u64,
    pub datagrams_dropped: u64,
    pub parse_errors: u64,
    pub uptime_seconds: u64,
}
