//! # Protocol Messages
//!
//! Typed values for everything that crosses the engine boundary:
//!
//! - [`Command`]: client → relay over the command channel (always canonical JSON)
//! - [`DatagramPayload`]: position/input updates over the datagram channel
//! - [`InboundEvent`]: relay → client, decoded once by the message codec
//! - [`ClientEvent`]: engine → game layer observer events

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Opaque password bytes. Never printed, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Password(String);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl Serialize for Password {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Caller-supplied login. The engine forwards it and does not keep a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Password,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Password::new(password),
        }
    }
}

/// Client → relay command-channel messages.
///
/// Serializes to `{"command":"NAME","name":...,"password":...}` and so on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Name {
        name: String,
        password: Password,
    },
    Authenticate {
        password: Password,
    },
    CreateRoom {
        name: String,
    },
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    LeaveRoom,
    StartGame,
    GetRoomPlayers {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    PlayerInfo,
    RelayMessage {
        #[serde(rename = "targetId")]
        target_id: String,
        message: String,
    },
    ListRooms,
    Ping {
        timestamp: u64,
    },
    Bye,
}

impl Command {
    /// Wire name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Name { .. } => "NAME",
            Command::Authenticate { .. } => "AUTHENTICATE",
            Command::CreateRoom { .. } => "CREATE_ROOM",
            Command::JoinRoom { .. } => "JOIN_ROOM",
            Command::LeaveRoom => "LEAVE_ROOM",
            Command::StartGame => "START_GAME",
            Command::GetRoomPlayers { .. } => "GET_ROOM_PLAYERS",
            Command::PlayerInfo => "PLAYER_INFO",
            Command::RelayMessage { .. } => "RELAY_MESSAGE",
            Command::ListRooms => "LIST_ROOMS",
            Command::Ping { .. } => "PING",
            Command::Bye => "BYE",
        }
    }
}

/// Driver input sample carried by `INPUT` datagrams
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct InputState {
    pub steering: f32,
    pub throttle: f32,
    pub brake: f32,
    #[serde(default)]
    pub timestamp: u64,
}

/// Datagram-channel messages, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum DatagramPayload {
    #[serde(rename = "UPDATE")]
    Update {
        #[serde(rename = "sessionId", alias = "session_id")]
        session_id: String,
        position: Vec3,
        #[serde(default)]
        rotation: Quat,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    #[serde(rename = "INPUT")]
    Input {
        #[serde(rename = "sessionId", alias = "session_id")]
        session_id: String,
        #[serde(rename = "roomId", alias = "room_id", default)]
        room_id: String,
        input: InputState,
        #[serde(default)]
        client_id: String,
    },
}

/// One room as advertised by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    #[serde(alias = "roomId", alias = "room_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "host_id")]
    pub host_id: Option<String>,
    #[serde(default, alias = "player_count")]
    pub player_count: u32,
    #[serde(default, alias = "max_players")]
    pub max_players: u32,
    #[serde(default, alias = "isActive", alias = "game_started")]
    pub active: bool,
}

/// Host of the current room as far as this client knows.
///
/// `Unknown` is reported as the literal `"unknown"`; it is never replaced by a guess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostId {
    Known(String),
    Unknown,
}

impl HostId {
    pub fn as_known(&self) -> Option<&str> {
        match self {
            HostId::Known(id) => Some(id),
            HostId::Unknown => None,
        }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostId::Known(id) => f.write_str(id),
            HostId::Unknown => f.write_str("unknown"),
        }
    }
}

/// Relay → client messages after decoding. Downstream code never sees raw keys.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected {
        session_id: String,
    },
    AuthResult {
        ok: bool,
        udp_encryption: bool,
        reason: Option<String>,
    },
    RoomCreated {
        room: RoomInfo,
    },
    RoomJoined {
        room: RoomInfo,
        players: Vec<String>,
    },
    JoinFailed {
        reason: String,
    },
    RoomList {
        rooms: Vec<RoomInfo>,
    },
    RoomPlayers {
        ids: Vec<String>,
    },
    PlayerJoined {
        player_id: String,
    },
    PlayerLeft {
        player_id: String,
    },
    GameStarted {
        room_id: String,
        spawn_by_session: HashMap<String, Vec3>,
    },
    PositionUpdate {
        session_id: String,
        pos: Vec3,
        rot: Quat,
        timestamp: Option<u64>,
    },
    InputUpdate {
        session_id: String,
        steer: f32,
        throttle: f32,
        brake: f32,
        timestamp: u64,
    },
    Relayed {
        sender_id: String,
        sender_name: String,
        text: String,
    },
    Pong {
        timestamp: Option<u64>,
    },
    ServerError {
        message: String,
    },
    /// A well-formed message whose command the client does not know
    UnknownCommand {
        command: String,
    },
    /// A line that could not be decoded at all; the connection continues
    ParseError {
        reason: String,
        raw: String,
    },
    Disconnected {
        reason: String,
    },
}

impl InboundEvent {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Connected { .. } => "Connected",
            InboundEvent::AuthResult { .. } => "AuthResult",
            InboundEvent::RoomCreated { .. } => "RoomCreated",
            InboundEvent::RoomJoined { .. } => "RoomJoined",
            InboundEvent::JoinFailed { .. } => "JoinFailed",
            InboundEvent::RoomList { .. } => "RoomList",
            InboundEvent::RoomPlayers { .. } => "RoomPlayers",
            InboundEvent::PlayerJoined { .. } => "PlayerJoined",
            InboundEvent::PlayerLeft { .. } => "PlayerLeft",
            InboundEvent::GameStarted { .. } => "GameStarted",
            InboundEvent::PositionUpdate { .. } => "PositionUpdate",
            InboundEvent::InputUpdate { .. } => "InputUpdate",
            InboundEvent::Relayed { .. } => "Relayed",
            InboundEvent::Pong { .. } => "Pong",
            InboundEvent::ServerError { .. } => "ServerError",
            InboundEvent::UnknownCommand { .. } => "UnknownCommand",
            InboundEvent::ParseError { .. } => "ParseError",
            InboundEvent::Disconnected { .. } => "Disconnected",
        }
    }
}

/// Category of a user-visible error event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Auth,
    Crypto,
    Protocol,
    Transport,
    Server,
    InvalidState,
}

/// Events surfaced to the game layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Connected {
        session_id: String,
    },
    Disconnected {
        reason: String,
    },
    ConnectionFailed {
        attempts: u32,
        error: String,
    },
    AuthChanged {
        authenticated: bool,
        reason: Option<String>,
    },
    RoomCreated(RoomInfo),
    RoomJoined(RoomInfo),
    RoomLeft {
        room_id: String,
    },
    JoinFailed {
        reason: String,
    },
    RoomListReceived(Vec<RoomInfo>),
    RosterChanged {
        room_id: String,
        players: Vec<String>,
    },
    GameStarted {
        room_id: String,
        spawn: Vec3,
    },
    PlayerPositionUpdate {
        session_id: String,
        position: Vec3,
        rotation: Quat,
        timestamp: Option<u64>,
    },
    PlayerInputUpdate {
        session_id: String,
        steer: f32,
        throttle: f32,
        brake: f32,
        timestamp: u64,
    },
    MessageReceived {
        sender_id: String,
        sender_name: String,
        text: String,
    },
    LatencyUpdated {
        rtt: Duration,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ClientEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ClientEvent::Error {
            kind,
            message: message.into(),
        }
    }
}
