//! # Rate-Limited Dispatcher
//!
//! Outbound queues for the two channels, drained by a fixed tick.
//!
//! The channels deliberately behave differently:
//! - **Command channel**: FIFO, lossless. A command waits until the interval since the
//!   previous command write has elapsed. Commands are not idempotent and must all arrive.
//! - **Datagram channel**: at most one pending datagram. A datagram offered while one is
//!   pending, or before the interval since the last datagram write has elapsed, is
//!   dropped. Position updates are superseded by the next one anyway.
//!
//! The dispatcher holds no sockets. [`Dispatcher::drain`] returns what is due and the
//! caller writes it, which keeps this type synchronous and clock-injectable.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::DispatchConfig;
use crate::protocol::message::{Command, DatagramPayload};

/// Which outbound channel a message uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Command,
    Datagram,
}

/// Message body by channel
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Command(Command),
    Datagram(DatagramPayload),
}

/// One queued message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub payload: Outbound,
    pub enqueued_at: Instant,
}

impl OutboundMessage {
    pub fn channel(&self) -> Channel {
        match self.payload {
            Outbound::Command(_) => Channel::Command,
            Outbound::Datagram(_) => Channel::Datagram,
        }
    }
}

/// Why a datagram was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Another datagram is still waiting for the next tick
    Pending,
    /// The channel interval has not elapsed since the last write
    TooSoon,
}

/// Minimum-interval gate for one channel.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    last_send: Option<Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_send: None,
            min_interval,
        }
    }

    /// Whether a send at `now` keeps the gap to the last send at least `min_interval`
    pub fn permits(&self, now: Instant) -> bool {
        match self.last_send {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn reset(&mut self) {
        self.last_send = None;
    }
}

/// Per-channel outbound queues with interval enforcement.
#[derive(Debug)]
pub struct Dispatcher {
    command_limiter: RateLimiter,
    datagram_limiter: RateLimiter,
    commands: VecDeque<OutboundMessage>,
    pending_datagram: Option<OutboundMessage>,
    max_command_queue: usize,
    datagrams_dropped: u64,
}

impl Dispatcher {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            command_limiter: RateLimiter::new(config.command_interval),
            datagram_limiter: RateLimiter::new(config.datagram_interval),
            commands: VecDeque::new(),
            pending_datagram: None,
            max_command_queue: config.max_command_queue,
            datagrams_dropped: 0,
        }
    }

    /// Queue a command. Returns `false` only when the queue is full.
    pub fn enqueue_command(&mut self, command: Command, now: Instant) -> bool {
        if self.commands.len() >= self.max_command_queue {
            warn!(
                command = command.name(),
                queued = self.commands.len(),
                "Command queue full, rejecting"
            );
            return false;
        }

        trace!(command = command.name(), "Command queued");
        self.commands.push_back(OutboundMessage {
            payload: Outbound::Command(command),
            enqueued_at: now,
        });
        true
    }

    /// Offer a datagram. Dropped, not queued, when it would violate the interval.
    pub fn enqueue_datagram(
        &mut self,
        payload: DatagramPayload,
        now: Instant,
    ) -> std::result::Result<(), DropReason> {
        let reason = if self.pending_datagram.is_some() {
            Some(DropReason::Pending)
        } else if !self.datagram_limiter.permits(now) {
            Some(DropReason::TooSoon)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.datagrams_dropped += 1;
            trace!(?reason, "Datagram dropped by rate limiter");
            return Err(reason);
        }

        self.pending_datagram = Some(OutboundMessage {
            payload: Outbound::Datagram(payload),
            enqueued_at: now,
        });
        Ok(())
    }

    /// Pop every message that may be written at `now`, recording the send times.
    ///
    /// At most one message per channel is released per call.
    pub fn drain(&mut self, now: Instant) -> Vec<OutboundMessage> {
        let mut due = Vec::with_capacity(2);

        if !self.commands.is_empty() && self.command_limiter.permits(now) {
            if let Some(msg) = self.commands.pop_front() {
                self.command_limiter.record(now);
                due.push(msg);
            }
        }

        if self.pending_datagram.is_some() && self.datagram_limiter.permits(now) {
            if let Some(msg) = self.pending_datagram.take() {
                self.datagram_limiter.record(now);
                due.push(msg);
            }
        }

        due
    }

    /// Discard everything queued. Used on disconnect; nothing is flushed.
    pub fn clear(&mut self) {
        let discarded = self.commands.len() + usize::from(self.pending_datagram.is_some());
        if discarded > 0 {
            debug!(discarded, "Discarding queued outbound messages");
        }
        self.commands.clear();
        self.pending_datagram = None;
        self.command_limiter.reset();
        self.datagram_limiter.reset();
    }

    pub fn queued_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn has_pending_datagram(&self) -> bool {
        self.pending_datagram.is_some()
    }

    pub fn datagrams_dropped(&self) -> u64 {
        self.datagrams_dropped
    }

    /// When the last command write happened (keepalive bookkeeping)
    pub fn last_command_send(&self) -> Option<Instant> {
        self.command_limiter.last_send()
    }
}
