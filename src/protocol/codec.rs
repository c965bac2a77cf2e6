//! # Message Codec
//!
//! Translates command-channel text and datagram JSON into [`InboundEvent`]s, and
//! [`Command`]s into canonical JSON.
//!
//! ## Inbound formats
//! ```text
//! {"command":"ROOM_CREATED","roomId":"room_1","name":"Fun"}   JSON object
//! ROOM_CREATED|room_1|Fun                                     pipe-delimited
//! PONG                                                        bare command
//! ```
//! The first character picks the parser (`{` → JSON, otherwise pipe split, otherwise a
//! bare command). Command names must match `[A-Z0-9_]+`. Both parsers produce the same `(command, Fields)` pair, which is then
//! decoded once into a typed event, so a JSON line and its pipe equivalent always yield
//! the same event.
//!
//! Decoding never fails: malformed input becomes [`InboundEvent::ParseError`] and unknown
//! commands become [`InboundEvent::UnknownCommand`].

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{
    Command, DatagramPayload, InboundEvent, InputState, Quat, RoomInfo, Vec3,
};

/// Normalized key-value form shared by both wire formats
pub type Fields = Map<String, Value>;

/// Which parser a line was routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Pipe,
    Bare,
}

/// Route a line by its first character.
pub fn detect_format(line: &str) -> WireFormat {
    let line = line.trim_start();
    if line.starts_with('{') {
        WireFormat::Json
    } else if line.contains('|') {
        WireFormat::Pipe
    } else {
        WireFormat::Bare
    }
}

/// Split a line into its command name and normalized fields.
pub fn normalize(line: &str) -> Result<(String, Fields)> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Parse(constants::ERR_EMPTY_LINE.into()));
    }

    match detect_format(line) {
        WireFormat::Json => {
            let value: Value = serde_json::from_str(line)
                .map_err(|e| ProtocolError::Parse(format!("Malformed JSON: {e}")))?;
            split_object(value)
        }
        WireFormat::Pipe => {
            let mut parts = line.split('|');
            let command = command_name(parts.next().unwrap_or_default())?;
            let params: Vec<&str> = parts.collect();
            let fields = pipe_fields(&command, &params)?;
            Ok((command, fields))
        }
        WireFormat::Bare => Ok((command_name(line)?, Fields::new())),
    }
}

/// Accept a token as a command name only if it is shaped like one: `[A-Z0-9_]+`.
fn command_name(token: &str) -> Result<String> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ProtocolError::Parse(constants::ERR_MISSING_COMMAND.into()));
    }
    let shaped = token
        .bytes()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');
    if !shaped {
        return Err(ProtocolError::Parse(format!(
            "{}: `{token}`",
            constants::ERR_MALFORMED_COMMAND
        )));
    }
    Ok(token.to_string())
}

/// Pull the command name out of a JSON object (`command`, or `type` as a fallback).
fn split_object(value: Value) -> Result<(String, Fields)> {
    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::Parse("Expected a JSON object".into()));
    };

    let command = match fields.remove("command").or_else(|| fields.remove("type")) {
        Some(Value::String(cmd)) if !cmd.is_empty() => cmd,
        _ => return Err(ProtocolError::Parse(constants::ERR_MISSING_COMMAND.into())),
    };

    Ok((command, fields))
}

fn parse_bool(command: &str, raw: &str) -> Result<Value> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Value::Bool(true)),
        "false" | "0" | "no" => Ok(Value::Bool(false)),
        other => Err(ProtocolError::Parse(format!(
            "{command}: expected a boolean, got '{other}'"
        ))),
    }
}

fn parse_number<T: std::str::FromStr + Into<Value>>(command: &str, raw: &str) -> Result<Value> {
    raw.trim()
        .parse::<T>()
        .map(Into::into)
        .map_err(|_| ProtocolError::Parse(format!("{command}: expected a number, got '{raw}'")))
}

fn non_empty(raw: Option<&&str>) -> Option<Value> {
    raw.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| Value::String(s.to_string()))
}

/// Parse `x,y,z` into a vector object
fn parse_vec3(command: &str, raw: &str) -> Result<Value> {
    let coords: Vec<f64> = raw
        .split(',')
        .map(|c| c.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| ProtocolError::Parse(format!("{command}: bad coordinates '{raw}'")))?;

    match coords.as_slice() {
        [x, y, z] => Ok(json!({ "x": x, "y": y, "z": z })),
        _ => Err(ProtocolError::Parse(format!(
            "{command}: expected x,y,z, got '{raw}'"
        ))),
    }
}

/// Positional mapping of pipe parameters to the field names JSON messages use.
fn pipe_fields(command: &str, params: &[&str]) -> Result<Fields> {
    let mut fields = Fields::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(v) = value {
            fields.insert(key.to_string(), v);
        }
    };

    match command {
        "CONNECTED" => put("sessionId", non_empty(params.first())),
        "NAME_OK" => {
            if let Some(raw) = params.first() {
                put("authenticated", Some(parse_bool(command, raw)?));
            }
            if let Some(raw) = params.get(1) {
                put("udpEncryption", Some(parse_bool(command, raw)?));
            }
        }
        "AUTH_FAILED" | "ERROR" => put("message", Some(Value::String(params.join("|")))),
        "JOIN_FAILED" => put("reason", Some(Value::String(params.join("|")))),
        "ROOM_CREATED" => {
            put("roomId", non_empty(params.first()));
            put("name", non_empty(params.get(1)));
        }
        "JOIN_OK" | "ROOM_JOINED" => {
            put("roomId", non_empty(params.first()));
            put("hostId", non_empty(params.get(1)));
        }
        "ROOM_LIST" => {
            // id|name|hostId|count/max, repeated
            let mut params = params;
            while let Some((last, rest)) = params.split_last() {
                if !last.trim().is_empty() {
                    break;
                }
                params = rest;
            }
            if params.len() % 4 != 0 {
                return Err(ProtocolError::Parse(format!(
                    "{command}: expected groups of 4 fields, got {}",
                    params.len()
                )));
            }
            let mut rooms = Vec::with_capacity(params.len() / 4);
            for group in params.chunks(4) {
                let mut room = Fields::new();
                room.insert("id".into(), Value::String(group[0].to_string()));
                room.insert("name".into(), Value::String(group[1].to_string()));
                if let Some(host) = non_empty(Some(&group[2])) {
                    room.insert("hostId".into(), host);
                }
                let (count, max) = group[3].split_once('/').unwrap_or((group[3], "0"));
                room.insert("playerCount".into(), parse_number::<u32>(command, count)?);
                room.insert("maxPlayers".into(), parse_number::<u32>(command, max)?);
                rooms.push(Value::Object(room));
            }
            put("rooms", Some(Value::Array(rooms)));
        }
        "ROOM_PLAYERS" => {
            let players = params
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| Value::String(p.trim().to_string()))
                .collect();
            put("players", Some(Value::Array(players)));
        }
        "PLAYER_JOINED" | "PLAYER_LEFT" | "PLAYER_DISCONNECTED" => {
            put("playerId", non_empty(params.first()))
        }
        "GAME_STARTED" => {
            put("roomId", non_empty(params.first()));
            let mut spawns = Fields::new();
            for entry in params.iter().skip(1).filter(|p| !p.is_empty()) {
                let (session, coords) = entry.split_once(':').ok_or_else(|| {
                    ProtocolError::Parse(format!("{command}: expected sessionId:x,y,z"))
                })?;
                spawns.insert(session.trim().to_string(), parse_vec3(command, coords)?);
            }
            put("spawnPositions", Some(Value::Object(spawns)));
        }
        "RELAYED_MESSAGE" | "RELAY" => {
            put("senderId", non_empty(params.first()));
            put("senderName", params.get(1).map(|s| Value::String(s.to_string())));
            if params.len() > 2 {
                put("message", Some(Value::String(params[2..].join("|"))));
            }
        }
        "PONG" | "PING_RESPONSE" => {
            if let Some(raw) = params.first().filter(|p| !p.is_empty()) {
                put("timestamp", Some(parse_number::<u64>(command, raw)?));
            }
        }
        _ => {
            let raw: Vec<Value> = params.iter().map(|p| Value::String(p.to_string())).collect();
            put("params", Some(Value::Array(raw)));
        }
    }

    Ok(fields)
}

fn from_fields<T: DeserializeOwned>(command: &str, fields: Fields) -> Result<T> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| ProtocolError::Parse(format!("{command}: {e}")))
}

#[derive(Deserialize)]
struct ConnectedWire {
    #[serde(
        rename = "sessionId",
        alias = "session_id",
        alias = "clientId",
        alias = "client_id"
    )]
    session_id: String,
}

#[derive(Deserialize)]
struct NameOkWire {
    #[serde(default = "default_true")]
    authenticated: bool,
    #[serde(default, rename = "udpEncryption", alias = "udp_encryption")]
    udp_encryption: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct MessageWire {
    #[serde(default, alias = "reason")]
    message: String,
}

#[derive(Deserialize)]
struct JoinOkWire {
    #[serde(rename = "roomId", alias = "room_id")]
    room_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "hostId", alias = "host_id")]
    host_id: Option<String>,
    #[serde(default)]
    players: Vec<PlayerRef>,
}

#[derive(Deserialize)]
struct RoomCreatedWire {
    #[serde(rename = "roomId", alias = "room_id")]
    room_id: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "hostId", alias = "host_id")]
    host_id: Option<String>,
    #[serde(default, rename = "maxPlayers", alias = "max_players")]
    max_players: u32,
}

#[derive(Deserialize)]
struct RoomListWire {
    #[serde(default)]
    rooms: Vec<RoomInfo>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlayerRef {
    Id(String),
    Entry {
        #[serde(alias = "sessionId", alias = "playerId", alias = "client_id")]
        id: String,
    },
}

impl PlayerRef {
    fn into_id(self) -> String {
        match self {
            PlayerRef::Id(id) | PlayerRef::Entry { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct RoomPlayersWire {
    #[serde(default)]
    players: Vec<PlayerRef>,
}

#[derive(Deserialize)]
struct PlayerWire {
    #[serde(
        rename = "playerId",
        alias = "player_id",
        alias = "sessionId",
        alias = "client_id"
    )]
    player_id: String,
}

#[derive(Deserialize)]
struct GameStartedWire {
    #[serde(default, rename = "roomId", alias = "room_id")]
    room_id: String,
    #[serde(default, rename = "spawnPositions", alias = "spawn_positions")]
    spawn_positions: HashMap<String, Vec3>,
}

#[derive(Deserialize)]
struct RelayedWire {
    #[serde(rename = "senderId", alias = "sender_id", alias = "from")]
    sender_id: String,
    #[serde(default, rename = "senderName", alias = "sender_name")]
    sender_name: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct PongWire {
    #[serde(default)]
    timestamp: Option<u64>,
}

/// Decode one command-channel line. Never fails.
pub fn decode_line(line: &str) -> InboundEvent {
    match normalize(line) {
        Ok((command, fields)) => decode_fields(&command, fields),
        Err(e) => InboundEvent::ParseError {
            reason: e.to_string(),
            raw: line.to_string(),
        },
    }
}

/// Decode a datagram body that has already been parsed as JSON.
pub fn decode_datagram(value: Value) -> InboundEvent {
    let raw = value.to_string();
    match split_object(value) {
        Ok((command, fields)) => decode_fields(&command, fields),
        Err(e) => InboundEvent::ParseError {
            reason: e.to_string(),
            raw,
        },
    }
}

/// Typed decode of a normalized message.
pub fn decode_fields(command: &str, fields: Fields) -> InboundEvent {
    let raw_fields = fields.clone();
    match try_decode(command, fields) {
        Ok(event) => event,
        Err(e) => {
            let mut raw = raw_fields;
            raw.insert("command".into(), Value::String(command.to_string()));
            InboundEvent::ParseError {
                reason: e.to_string(),
                raw: Value::Object(raw).to_string(),
            }
        }
    }
}

fn try_decode(command: &str, fields: Fields) -> Result<InboundEvent> {
    let event = match command {
        "CONNECTED" => {
            let wire: ConnectedWire = from_fields(command, fields)?;
            if wire.session_id.is_empty() {
                return Err(ProtocolError::Parse("CONNECTED: empty session id".into()));
            }
            InboundEvent::Connected {
                session_id: wire.session_id,
            }
        }
        "NAME_OK" => {
            let wire: NameOkWire = from_fields(command, fields)?;
            InboundEvent::AuthResult {
                ok: wire.authenticated,
                udp_encryption: wire.udp_encryption,
                reason: None,
            }
        }
        "AUTH_FAILED" => {
            let wire: MessageWire = from_fields(command, fields)?;
            InboundEvent::AuthResult {
                ok: false,
                udp_encryption: false,
                reason: Some(wire.message),
            }
        }
        "ROOM_CREATED" => {
            let wire: RoomCreatedWire = from_fields(command, fields)?;
            InboundEvent::RoomCreated {
                room: RoomInfo {
                    id: wire.room_id,
                    name: wire.name,
                    host_id: wire.host_id,
                    player_count: 1,
                    max_players: wire.max_players,
                    active: false,
                },
            }
        }
        "JOIN_OK" | "ROOM_JOINED" => {
            let wire: JoinOkWire = from_fields(command, fields)?;
            let players: Vec<String> = wire.players.into_iter().map(PlayerRef::into_id).collect();
            InboundEvent::RoomJoined {
                room: RoomInfo {
                    id: wire.room_id,
                    name: wire.name.unwrap_or_default(),
                    host_id: wire.host_id,
                    player_count: players.len() as u32,
                    max_players: 0,
                    active: false,
                },
                players,
            }
        }
        "JOIN_FAILED" => {
            let wire: MessageWire = from_fields(command, fields)?;
            InboundEvent::JoinFailed {
                reason: wire.message,
            }
        }
        "ROOM_LIST" => {
            let wire: RoomListWire = from_fields(command, fields)?;
            InboundEvent::RoomList { rooms: wire.rooms }
        }
        "ROOM_PLAYERS" => {
            let wire: RoomPlayersWire = from_fields(command, fields)?;
            InboundEvent::RoomPlayers {
                ids: wire.players.into_iter().map(PlayerRef::into_id).collect(),
            }
        }
        "PLAYER_JOINED" => {
            let wire: PlayerWire = from_fields(command, fields)?;
            InboundEvent::PlayerJoined {
                player_id: wire.player_id,
            }
        }
        "PLAYER_LEFT" | "PLAYER_DISCONNECTED" => {
            let wire: PlayerWire = from_fields(command, fields)?;
            InboundEvent::PlayerLeft {
                player_id: wire.player_id,
            }
        }
        "GAME_STARTED" => {
            let wire: GameStartedWire = from_fields(command, fields)?;
            InboundEvent::GameStarted {
                room_id: wire.room_id,
                spawn_by_session: wire.spawn_positions,
            }
        }
        "UPDATE" | "INPUT" => {
            let mut fields = fields;
            fields.insert("command".into(), Value::String(command.to_string()));
            match from_fields::<DatagramPayload>(command, fields)? {
                DatagramPayload::Update {
                    session_id,
                    position,
                    rotation,
                    timestamp,
                } => InboundEvent::PositionUpdate {
                    session_id,
                    pos: position,
                    rot: rotation,
                    timestamp,
                },
                DatagramPayload::Input {
                    session_id,
                    input:
                        InputState {
                            steering,
                            throttle,
                            brake,
                            timestamp,
                        },
                    ..
                } => InboundEvent::InputUpdate {
                    session_id,
                    steer: steering,
                    throttle,
                    brake,
                    timestamp,
                },
            }
        }
        "RELAYED_MESSAGE" | "RELAY" => {
            let wire: RelayedWire = from_fields(command, fields)?;
            InboundEvent::Relayed {
                sender_id: wire.sender_id,
                sender_name: wire.sender_name,
                text: wire.message,
            }
        }
        "PONG" | "PING_RESPONSE" => {
            let wire: PongWire = from_fields(command, fields)?;
            InboundEvent::Pong {
                timestamp: wire.timestamp,
            }
        }
        "ERROR" => {
            let wire: MessageWire = from_fields(command, fields)?;
            InboundEvent::ServerError {
                message: wire.message,
            }
        }
        other => InboundEvent::UnknownCommand {
            command: other.to_string(),
        },
    };

    Ok(event)
}

/// Serialize a command as one canonical JSON line (no trailing newline).
pub fn encode_command(command: &Command) -> Result<String> {
    Ok(serde_json::to_string(command)?)
}

/// Serialize a datagram payload to the JSON value the datagram codec encrypts.
pub fn encode_datagram(payload: &DatagramPayload) -> Result<Value> {
    Ok(serde_json::to_value(payload)?)
}

/// Build an `UPDATE` payload for the local session
pub fn position_update(session_id: &str, position: Vec3, rotation: Quat, timestamp: u64) -> DatagramPayload {
    DatagramPayload::Update {
        session_id: session_id.to_string(),
        position,
        rotation,
        timestamp: Some(timestamp),
    }
}

/// Build an `INPUT` payload for the local session
pub fn input_update(
    session_id: &str,
    room_id: &str,
    steering: f32,
    throttle: f32,
    brake: f32,
    timestamp: u64,
) -> DatagramPayload {
    DatagramPayload::Input {
        session_id: session_id.to_string(),
        room_id: room_id.to_string(),
        input: InputState {
            steering,
            throttle,
            brake,
            timestamp,
        },
        client_id: session_id.to_string(),
    }
}
