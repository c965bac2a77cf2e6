//! # Session State Machine
//!
//! Owns everything that describes one logical session with the relay:
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingWelcome -> Authenticating -> Authenticated <-> InRoom
//!       ^                                                                   |
//!       +----------------------------- Error <------------------------------+
//! ```
//!
//! The session id is written once per connection, by the welcome line. A
//! [`CryptoContext`] exists exactly when the session is authenticated and the relay
//! advertised datagram encryption. Leaving `Authenticated`/`InRoom` for any reason tears
//! down crypto, room state and both outbound queues together.
//!
//! `Session` does no I/O. The engine feeds it decoded [`InboundEvent`]s and caller
//! commands, pulls due messages with [`Session::poll_outbound`], and forwards the
//! [`ClientEvent`]s collected by [`Session::take_events`].

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::error::{constants, ConnectError, ProtocolError, Result};
use crate::protocol::codec;
use crate::protocol::dispatcher::{Dispatcher, DropReason, Outbound, OutboundMessage};
use crate::protocol::message::{
    ClientEvent, Command, Credentials, DatagramPayload, ErrorKind, InboundEvent, Password, Quat,
    Vec3,
};
use crate::protocol::room::{CurrentRoom, RoomController};
use crate::transport::datagram::{DatagramCodec, DatagramStats, DecodeOutcome};
use crate::utils::crypto::CryptoContext;
use crate::utils::time::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingWelcome,
    Authenticating,
    Authenticated,
    InRoom,
    Error,
}

impl SessionState {
    /// A transport is up (welcome may still be pending)
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::AwaitingWelcome
                | SessionState::Authenticating
                | SessionState::Authenticated
                | SessionState::InRoom
        )
    }

    pub fn is_authenticated(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::InRoom)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::AwaitingWelcome => "AwaitingWelcome",
            SessionState::Authenticating => "Authenticating",
            SessionState::Authenticated => "Authenticated",
            SessionState::InRoom => "InRoom",
            SessionState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Wire-ready form of an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// One JSON line for the command channel, without terminator
    Line(String),
    /// One framed datagram
    Datagram(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    pub commands_released: u64,
    pub datagrams_released: u64,
    pub datagrams_rate_limited: u64,
    pub last_rtt: Option<Duration>,
}

/// Point-in-time copy of the session for callers
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub authenticated: bool,
    pub udp_encrypted: bool,
    pub room: Option<CurrentRoom>,
    pub players: Vec<String>,
    pub queued_commands: usize,
    pub stats: SessionStats,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    session_id: Option<String>,
    authenticated: bool,
    crypto: Option<CryptoContext>,
    datagrams: DatagramCodec,
    shared_secret: String,
    max_packet_size: usize,
    rooms: RoomController,
    dispatcher: Dispatcher,
    keepalive_interval: Duration,
    connected_at: Option<Instant>,
    ping_sent_at: Option<Instant>,
    stats: SessionStats,
    events: Vec<ClientEvent>,
}

impl Session {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            state: SessionState::Disconnected,
            session_id: None,
            authenticated: false,
            crypto: None,
            datagrams: DatagramCodec::with_max_packet_size(None, config.datagram.max_packet_size),
            shared_secret: config.datagram.shared_secret.clone(),
            max_packet_size: config.datagram.max_packet_size,
            rooms: RoomController::new(&config.room),
            dispatcher: Dispatcher::new(&config.dispatch),
            keepalive_interval: config.client.keepalive_interval,
            connected_at: None,
            ping_sent_at: None,
            stats: SessionStats::default(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn crypto(&self) -> Option<&CryptoContext> {
        self.crypto.as_ref()
    }

    /// Decode totals of the current datagram codec; reset when the key changes.
    pub fn datagram_stats(&self) -> DatagramStats {
        self.datagrams.stats()
    }

    pub fn rooms(&self) -> &RoomController {
        &self.rooms
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Drain the events produced since the last call
    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            session_id: self.session_id.clone(),
            authenticated: self.authenticated,
            udp_encrypted: self.crypto.is_some(),
            room: self.rooms.current_room().cloned(),
            players: self.rooms.roster(),
            queued_commands: self.dispatcher.queued_commands(),
            stats: self.stats,
        }
    }

    fn emit(&mut self, event: ClientEvent) {
        self.events.push(event);
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        info!(%from, %to, "Session state changed");
        self.emit(ClientEvent::StateChanged { from, to });
    }

    /// Drop every piece of per-connection state
    fn teardown(&mut self) {
        self.dispatcher.clear();
        self.crypto = None;
        self.datagrams = DatagramCodec::with_max_packet_size(None, self.max_packet_size);
        self.authenticated = false;
        self.session_id = None;
        self.rooms.reset();
        self.connected_at = None;
        self.ping_sent_at = None;
    }

    // ---- connection lifecycle ----

    pub fn begin_connect(&mut self) -> Result<()> {
        match self.state {
            SessionState::Disconnected | SessionState::Error => {
                self.teardown();
                self.transition(SessionState::Connecting);
                Ok(())
            }
            other => Err(ProtocolError::InvalidState(format!(
                "cannot connect while {other}"
            ))),
        }
    }

    pub fn transport_opened(&mut self, now: Instant) {
        if self.state != SessionState::Connecting {
            warn!(state = %self.state, "Transport opened outside of Connecting");
        }
        self.connected_at = Some(now);
        self.transition(SessionState::AwaitingWelcome);
    }

    /// All connection attempts are exhausted (or one failed fatally)
    pub fn connect_failed(&mut self, attempts: u32, error: &ConnectError) {
        self.teardown();
        self.transition(SessionState::Error);
        self.emit(ClientEvent::ConnectionFailed {
            attempts,
            error: error.to_string(),
        });
    }

    /// The transport went away or the caller disconnected
    pub fn disconnect(&mut self, reason: &str) {
        if matches!(self.state, SessionState::Disconnected) {
            return;
        }
        info!(reason, "Session disconnected");
        self.teardown();
        self.transition(SessionState::Disconnected);
        self.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Move to `Error` with an error event
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        warn!(?kind, %message, "Session failed");
        self.teardown();
        self.transition(SessionState::Error);
        self.emit(ClientEvent::error(kind, message));
    }

    // ---- inbound ----

    /// Apply one decoded relay message.
    #[instrument(level = "trace", skip(self, event, now), fields(kind = event.kind()))]
    pub fn handle(&mut self, event: InboundEvent, now: Instant) {
        match event {
            InboundEvent::Connected { session_id } => self.on_welcome(session_id),
            InboundEvent::AuthResult {
                ok,
                udp_encryption,
                reason,
            } => self.on_auth_result(ok, udp_encryption, reason, now),
            InboundEvent::Disconnected { reason } => self.disconnect(&reason),
            InboundEvent::Pong { .. } => {
                if let Some(sent) = self.ping_sent_at.take() {
                    let rtt = now.saturating_duration_since(sent);
                    self.stats.last_rtt = Some(rtt);
                    self.emit(ClientEvent::LatencyUpdated { rtt });
                } else {
                    debug!("PONG without an outstanding PING");
                }
            }
            InboundEvent::ServerError { message } => {
                warn!(%message, "Relay reported an error");
                self.emit(ClientEvent::error(ErrorKind::Server, message));
            }
            InboundEvent::UnknownCommand { command } => {
                debug!(%command, "Unknown relay command");
                self.emit(ClientEvent::error(
                    ErrorKind::Parse,
                    format!("Unknown command: {command}"),
                ));
            }
            InboundEvent::ParseError { reason, raw } => {
                debug!(%reason, %raw, "Undecodable relay line");
                self.emit(ClientEvent::error(ErrorKind::Parse, reason));
            }
            other if !self.authenticated => {
                warn!(kind = other.kind(), state = %self.state, "Ignoring message before authentication");
            }
            other => self.on_authenticated_event(other, now),
        }
    }

    fn on_welcome(&mut self, session_id: String) {
        if self.session_id.is_some() {
            self.emit(ClientEvent::error(
                ErrorKind::Protocol,
                "duplicate welcome on an established session",
            ));
            return;
        }
        if !matches!(
            self.state,
            SessionState::Connecting | SessionState::AwaitingWelcome
        ) {
            warn!(state = %self.state, "Welcome outside of handshake ignored");
            return;
        }

        info!(session_id = %session_id, "Session established");
        self.rooms.set_local_session(&session_id);
        self.session_id = Some(session_id.clone());
        self.transition(SessionState::Authenticating);
        self.emit(ClientEvent::Connected { session_id });
    }

    fn on_auth_result(
        &mut self,
        ok: bool,
        udp_encryption: bool,
        reason: Option<String>,
        now: Instant,
    ) {
        if self.state != SessionState::Authenticating {
            debug!(state = %self.state, ok, "Auth result outside of Authenticating ignored");
            return;
        }

        if !ok {
            let reason = reason.unwrap_or_else(|| "password required".to_string());
            info!(%reason, "Authentication not complete");
            self.emit(ClientEvent::AuthChanged {
                authenticated: false,
                reason: Some(reason),
            });
            return;
        }

        let Some(session_id) = self.session_id.clone() else {
            self.fail(ErrorKind::Protocol, constants::ERR_WELCOME_MISSING);
            return;
        };

        self.authenticated = true;
        if udp_encryption {
            let ctx = CryptoContext::derive(&session_id, &self.shared_secret);
            self.datagrams =
                DatagramCodec::with_max_packet_size(Some(ctx.cipher().clone()), self.max_packet_size);
            self.crypto = Some(ctx);
        } else {
            self.datagrams = DatagramCodec::with_max_packet_size(None, self.max_packet_size);
            self.crypto = None;
        }

        info!(session_id = %session_id, udp_encryption, "Authenticated");
        self.transition(SessionState::Authenticated);
        self.emit(ClientEvent::AuthChanged {
            authenticated: true,
            reason: None,
        });

        // Relay expects player info right after login
        if !self.dispatcher.enqueue_command(Command::PlayerInfo, now) {
            warn!("Could not queue PLAYER_INFO");
        }
    }

    fn on_authenticated_event(&mut self, event: InboundEvent, now: Instant) {
        let events = match event {
            InboundEvent::RoomCreated { room } => {
                let events = self.rooms.on_room_created(room, now);
                self.transition(SessionState::InRoom);
                events
            }
            InboundEvent::RoomJoined { room, players } => {
                let events = self.rooms.on_room_joined(room, players, now);
                self.transition(SessionState::InRoom);
                events
            }
            InboundEvent::JoinFailed { reason } => self.rooms.on_join_failed(reason),
            InboundEvent::RoomList { rooms } => self.rooms.on_room_list(rooms),
            InboundEvent::RoomPlayers { ids } => self.rooms.on_room_players(ids),
            InboundEvent::PlayerJoined { player_id } => self.rooms.on_player_joined(player_id),
            InboundEvent::PlayerLeft { player_id } => self.rooms.on_player_left(&player_id),
            InboundEvent::GameStarted {
                room_id,
                spawn_by_session,
            } => self.rooms.on_game_started(room_id, &spawn_by_session),
            InboundEvent::PositionUpdate {
                session_id,
                pos,
                rot,
                timestamp,
            } => {
                if self.is_own(&session_id) {
                    return;
                }
                vec![ClientEvent::PlayerPositionUpdate {
                    session_id,
                    position: pos,
                    rotation: rot,
                    timestamp,
                }]
            }
            InboundEvent::InputUpdate {
                session_id,
                steer,
                throttle,
                brake,
                timestamp,
            } => {
                if self.is_own(&session_id) {
                    return;
                }
                vec![ClientEvent::PlayerInputUpdate {
                    session_id,
                    steer,
                    throttle,
                    brake,
                    timestamp,
                }]
            }
            InboundEvent::Relayed {
                sender_id,
                sender_name,
                text,
            } => vec![ClientEvent::MessageReceived {
                sender_id,
                sender_name,
                text,
            }],
            other => {
                debug!(kind = other.kind(), "Unhandled event");
                Vec::new()
            }
        };
        self.events.extend(events);
    }

    fn is_own(&self, session_id: &str) -> bool {
        self.session_id.as_deref() == Some(session_id)
    }

    /// Decode one received datagram and apply it.
    ///
    /// Datagram problems never surface as error events; the outcome is returned for
    /// counting only.
    pub fn handle_datagram(&mut self, bytes: &[u8], now: Instant) -> DecodeOutcome {
        if !self.authenticated {
            debug!(len = bytes.len(), "Datagram before authentication dropped");
            return DecodeOutcome::Dropped;
        }

        let outcome = self.datagrams.decode_detailed(bytes);
        let value = match &outcome {
            DecodeOutcome::Decrypted(v) | DecodeOutcome::Plaintext(v) => v.clone(),
            DecodeOutcome::Dropped => return outcome,
        };

        match codec::decode_datagram(value) {
            InboundEvent::ParseError { reason, .. } => {
                debug!(%reason, "Datagram payload not understood");
                DecodeOutcome::Dropped
            }
            InboundEvent::UnknownCommand { command } => {
                debug!(%command, "Unknown datagram command");
                DecodeOutcome::Dropped
            }
            event => {
                self.handle(event, now);
                outcome
            }
        }
    }

    // ---- caller commands ----

    fn enqueue(&mut self, command: Command, now: Instant) -> Result<()> {
        if self.dispatcher.enqueue_command(command, now) {
            Ok(())
        } else {
            Err(ProtocolError::Transport("command queue full".into()))
        }
    }

    fn require_authenticating(&self) -> Result<()> {
        if self.state == SessionState::Authenticating {
            Ok(())
        } else {
            Err(ProtocolError::InvalidState(format!(
                "cannot authenticate while {}",
                self.state
            )))
        }
    }

    fn require_authenticated(&self) -> Result<()> {
        if self.authenticated && self.state.is_authenticated() {
            Ok(())
        } else {
            Err(ProtocolError::InvalidState(format!(
                "{} ({})",
                constants::ERR_NOT_AUTHENTICATED,
                self.state
            )))
        }
    }

    /// Queue `NAME`. The credentials are moved into the command and not kept.
    pub fn authenticate(&mut self, credentials: Credentials, now: Instant) -> Result<()> {
        self.require_authenticating()?;
        let Credentials { username, password } = credentials;
        self.enqueue(
            Command::Name {
                name: username,
                password,
            },
            now,
        )
    }

    /// Queue `AUTHENTICATE` after a `NAME_OK` that asked for a password
    pub fn submit_password(&mut self, password: Password, now: Instant) -> Result<()> {
        self.require_authenticating()?;
        self.enqueue(Command::Authenticate { password }, now)
    }

    pub fn create_room(&mut self, name: &str, now: Instant) -> Result<()> {
        self.require_authenticated()?;
        let command = self.rooms.create_room(name)?;
        self.enqueue(command, now)
    }

    pub fn join_room(&mut self, room_id: &str, now: Instant) -> Result<()> {
        self.require_authenticated()?;
        let command = self.rooms.join_room(room_id)?;
        self.enqueue(command, now)
    }

    pub fn leave_room(&mut self, now: Instant) -> Result<()> {
        self.require_authenticated()?;
        let (command, event) = self.rooms.leave_room()?;
        self.enqueue(command, now)?;
        self.transition(SessionState::Authenticated);
        self.emit(event);
        Ok(())
    }

    pub fn start_game(&mut self, now: Instant) -> Result<()> {
        self.require_authenticated()?;
        let command = self.rooms.start_game()?;
        self.enqueue(command, now)
    }

    pub fn request_room_players(&mut self, now: Instant) -> Result<()> {
        self.require_authenticated()?;
        let command = self.rooms.request_players()?;
        self.enqueue(command, now)
    }

    pub fn list_rooms(&mut self, now: Instant) -> Result<()> {
        self.require_authenticated()?;
        self.enqueue(Command::ListRooms, now)
    }

    pub fn relay_message(&mut self, target_id: &str, message: &str, now: Instant) -> Result<()> {
        self.require_authenticated()?;
        self.enqueue(
            Command::RelayMessage {
                target_id: target_id.to_string(),
                message: message.to_string(),
            },
            now,
        )
    }

    /// Queue a `PING`; the RTT is measured from when it is actually written
    pub fn ping(&mut self, now: Instant) -> Result<()> {
        if !self.state.is_connected() {
            return Err(ProtocolError::InvalidState(format!(
                "cannot ping while {}",
                self.state
            )));
        }
        self.enqueue(
            Command::Ping {
                timestamp: now_millis(),
            },
            now,
        )
    }

    /// Offer a position update. `Ok(false)` means the rate limiter dropped it.
    pub fn send_position(&mut self, position: Vec3, rotation: Quat, now: Instant) -> Result<bool> {
        self.require_authenticated()?;
        let session_id = self.session_id.clone().unwrap_or_default();
        let payload = codec::position_update(&session_id, position, rotation, now_millis());
        Ok(self.offer_datagram(payload, now))
    }

    /// Offer an input update. `Ok(false)` means the rate limiter dropped it.
    pub fn send_input(&mut self, steer: f32, throttle: f32, brake: f32, now: Instant) -> Result<bool> {
        self.require_authenticated()?;
        let session_id = self.session_id.clone().unwrap_or_default();
        let room_id = self.rooms.room_id().unwrap_or_default().to_string();
        let payload =
            codec::input_update(&session_id, &room_id, steer, throttle, brake, now_millis());
        Ok(self.offer_datagram(payload, now))
    }

    fn offer_datagram(&mut self, payload: DatagramPayload, now: Instant) -> bool {
        match self.dispatcher.enqueue_datagram(payload, now) {
            Ok(()) => true,
            Err(DropReason::Pending | DropReason::TooSoon) => {
                self.stats.datagrams_rate_limited += 1;
                false
            }
        }
    }

    // ---- outbound ----

    /// Housekeeping plus dispatcher drain; returns what may be written now.
    pub fn poll_outbound(&mut self, now: Instant) -> Vec<OutboundMessage> {
        if self.state == SessionState::InRoom {
            if let Some(refresh) = self.rooms.tick(now) {
                if !self.dispatcher.enqueue_command(refresh, now) {
                    debug!("Roster refresh skipped, queue full");
                }
            }
        }

        if self.keepalive_due(now) {
            debug!("Idle, sending keepalive PING");
            if let Err(e) = self.ping(now) {
                debug!(error = %e, "Keepalive skipped");
            }
        }

        let due = self.dispatcher.drain(now);
        for msg in &due {
            match &msg.payload {
                Outbound::Command(Command::Ping { .. }) => {
                    self.ping_sent_at = Some(now);
                    self.stats.commands_released += 1;
                }
                Outbound::Command(_) => self.stats.commands_released += 1,
                Outbound::Datagram(_) => self.stats.datagrams_released += 1,
            }
        }
        due
    }

    fn keepalive_due(&self, now: Instant) -> bool {
        if !matches!(
            self.state,
            SessionState::Authenticating | SessionState::Authenticated | SessionState::InRoom
        ) || self.dispatcher.queued_commands() > 0
            || self.keepalive_interval.is_zero()
        {
            return false;
        }

        let last = match (self.dispatcher.last_command_send(), self.connected_at) {
            (Some(sent), Some(opened)) => sent.max(opened),
            (Some(t), None) | (None, Some(t)) => t,
            (None, None) => return false,
        };
        now.saturating_duration_since(last) >= self.keepalive_interval
    }

    /// Serialize a released message for its channel
    pub fn encode(&self, message: &OutboundMessage) -> Result<WireMessage> {
        match &message.payload {
            Outbound::Command(command) => Ok(WireMessage::Line(codec::encode_command(command)?)),
            Outbound::Datagram(payload) => {
                let value = codec::encode_datagram(payload)?;
                Ok(WireMessage::Datagram(self.datagrams.encode(&value)?))
            }
        }
    }
}
