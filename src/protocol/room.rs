//! # Room Lifecycle
//!
//! Keeps the client's view of its current room (id, host, roster) consistent with what
//! the relay has actually said, and builds the room commands the user issues.
//!
//! Host resolution on join, in order:
//! 1. `hostId` on the join event, if present and meaningful
//! 2. the host recorded for that room in the last `ROOM_LIST`
//! 3. [`HostId::Unknown`], never the local session id
//!
//! The roster only changes on explicit relay events (`JOIN_OK`, `ROOM_PLAYERS`,
//! `PLAYER_JOINED`, `PLAYER_LEFT`) or on a local leave/disconnect. Because join and leave
//! notices are not guaranteed to reach every peer in order, [`RoomController::tick`]
//! re-requests the roster periodically while in a room.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RoomConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{ClientEvent, Command, ErrorKind, HostId, RoomInfo, Vec3};

/// The room this client is in
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentRoom {
    pub id: String,
    pub name: String,
    pub host: HostId,
    pub game_started: bool,
    /// Spawn assigned by the relay at game start
    pub spawn: Option<Vec3>,
}

#[derive(Debug)]
pub struct RoomController {
    local_session: Option<String>,
    current: Option<CurrentRoom>,
    roster: BTreeSet<String>,
    room_cache: HashMap<String, RoomInfo>,
    pending_join: Option<String>,
    refresh_interval: Duration,
    last_refresh: Option<Instant>,
}

/// Treat empty strings and a literal "unknown" from the relay as "no host given".
fn meaningful_host(host: Option<String>) -> Option<String> {
    host.map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty() && !h.eq_ignore_ascii_case("unknown"))
}

impl RoomController {
    pub fn new(config: &RoomConfig) -> Self {
        Self {
            local_session: None,
            current: None,
            roster: BTreeSet::new(),
            room_cache: HashMap::new(),
            pending_join: None,
            refresh_interval: config.roster_refresh_interval,
            last_refresh: None,
        }
    }

    pub fn set_local_session(&mut self, session_id: &str) {
        self.local_session = Some(session_id.to_string());
    }

    pub fn current_room(&self) -> Option<&CurrentRoom> {
        self.current.as_ref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.current.as_ref().map(|r| r.id.as_str())
    }

    pub fn host(&self) -> Option<&HostId> {
        self.current.as_ref().map(|r| &r.host)
    }

    pub fn in_room(&self) -> bool {
        self.current.is_some()
    }

    /// Roster in a stable (sorted) order; the relay's order carries no meaning
    pub fn roster(&self) -> Vec<String> {
        self.roster.iter().cloned().collect()
    }

    pub fn cached_rooms(&self) -> impl Iterator<Item = &RoomInfo> {
        self.room_cache.values()
    }

    pub fn is_local_host(&self) -> bool {
        match (self.host(), &self.local_session) {
            (Some(HostId::Known(host)), Some(me)) => host == me,
            _ => false,
        }
    }

    fn roster_event(&self) -> Option<ClientEvent> {
        self.current.as_ref().map(|room| ClientEvent::RosterChanged {
            room_id: room.id.clone(),
            players: self.roster(),
        })
    }

    fn require_room(&self) -> Result<&CurrentRoom> {
        self.current
            .as_ref()
            .ok_or_else(|| ProtocolError::InvalidState(constants::ERR_NOT_IN_ROOM.into()))
    }

    // ---- user commands ----

    pub fn create_room(&mut self, name: &str) -> Result<Command> {
        if let Some(room) = &self.current {
            return Err(ProtocolError::InvalidState(format!(
                "already in room {}",
                room.id
            )));
        }
        Ok(Command::CreateRoom {
            name: name.to_string(),
        })
    }

    pub fn join_room(&mut self, room_id: &str) -> Result<Command> {
        if let Some(room) = &self.current {
            return Err(ProtocolError::InvalidState(format!(
                "already in room {}",
                room.id
            )));
        }
        self.pending_join = Some(room_id.to_string());
        Ok(Command::JoinRoom {
            room_id: room_id.to_string(),
        })
    }

    /// Leave locally and produce `LEAVE_ROOM`. Room state is cleared immediately.
    pub fn leave_room(&mut self) -> Result<(Command, ClientEvent)> {
        let room = self.require_room()?.id.clone();
        self.clear_room();
        info!(room_id = %room, "Left room");
        Ok((Command::LeaveRoom, ClientEvent::RoomLeft { room_id: room }))
    }

    /// `START_GAME`, refused locally only when another player is known to be host.
    pub fn start_game(&self) -> Result<Command> {
        let room = self.require_room()?;
        if let HostId::Known(host) = &room.host {
            if self.local_session.as_deref() != Some(host.as_str()) {
                return Err(ProtocolError::NotHost);
            }
        }
        Ok(Command::StartGame)
    }

    pub fn request_players(&self) -> Result<Command> {
        let room = self.require_room()?;
        Ok(Command::GetRoomPlayers {
            room_id: room.id.clone(),
        })
    }

    // ---- relay events ----

    pub fn on_room_created(&mut self, mut room: RoomInfo, now: Instant) -> Vec<ClientEvent> {
        // The creator is the host, whether or not the relay says so
        let host = meaningful_host(room.host_id.take())
            .or_else(|| self.local_session.clone())
            .map(HostId::Known)
            .unwrap_or(HostId::Unknown);

        room.host_id = host.as_known().map(str::to_string);
        self.roster.clear();
        if let Some(me) = &self.local_session {
            self.roster.insert(me.clone());
        }
        room.player_count = self.roster.len() as u32;

        self.current = Some(CurrentRoom {
            id: room.id.clone(),
            name: room.name.clone(),
            host,
            game_started: false,
            spawn: None,
        });
        self.pending_join = None;
        self.last_refresh = Some(now);

        info!(room_id = %room.id, name = %room.name, "Room created");
        let mut events = vec![ClientEvent::RoomCreated(room)];
        events.extend(self.roster_event());
        events
    }

    pub fn on_room_joined(
        &mut self,
        mut room: RoomInfo,
        players: Vec<String>,
        now: Instant,
    ) -> Vec<ClientEvent> {
        let cached = self.room_cache.get(&room.id);
        let host = match meaningful_host(room.host_id.take()) {
            Some(host) => HostId::Known(host),
            None => match cached.and_then(|c| meaningful_host(c.host_id.clone())) {
                Some(host) => {
                    debug!(room_id = %room.id, host = %host, "Host taken from cached room list");
                    HostId::Known(host)
                }
                None => {
                    warn!(room_id = %room.id, "Join event carried no host and room is not cached");
                    HostId::Unknown
                }
            },
        };

        if room.name.is_empty() {
            if let Some(c) = cached {
                room.name = c.name.clone();
            }
        }
        if room.max_players == 0 {
            if let Some(c) = cached {
                room.max_players = c.max_players;
            }
        }

        self.roster = players.into_iter().filter(|p| !p.is_empty()).collect();
        if let Some(me) = &self.local_session {
            self.roster.insert(me.clone());
        }
        room.player_count = self.roster.len() as u32;
        room.host_id = match &host {
            HostId::Known(id) => Some(id.clone()),
            HostId::Unknown => Some(HostId::Unknown.to_string()),
        };

        if let Some(expected) = self.pending_join.take() {
            if expected != room.id {
                warn!(expected = %expected, joined = %room.id, "Joined a different room than requested");
            }
        }

        self.current = Some(CurrentRoom {
            id: room.id.clone(),
            name: room.name.clone(),
            host,
            game_started: false,
            spawn: None,
        });
        self.last_refresh = Some(now);

        info!(room_id = %room.id, players = self.roster.len(), "Joined room");
        let mut events = vec![ClientEvent::RoomJoined(room)];
        events.extend(self.roster_event());
        events
    }

    pub fn on_join_failed(&mut self, reason: String) -> Vec<ClientEvent> {
        self.pending_join = None;
        warn!(reason = %reason, "Join failed");
        vec![ClientEvent::JoinFailed { reason }]
    }

    /// Replace the room-list cache
    pub fn on_room_list(&mut self, rooms: Vec<RoomInfo>) -> Vec<ClientEvent> {
        self.room_cache = rooms.iter().map(|r| (r.id.clone(), r.clone())).collect();
        debug!(rooms = rooms.len(), "Room list cached");
        vec![ClientEvent::RoomListReceived(rooms)]
    }

    pub fn on_room_players(&mut self, ids: Vec<String>) -> Vec<ClientEvent> {
        if self.current.is_none() {
            debug!("Ignoring roster for a room we are not in");
            return Vec::new();
        }

        let roster: BTreeSet<String> = ids.into_iter().filter(|p| !p.is_empty()).collect();
        if roster == self.roster {
            return Vec::new();
        }
        self.roster = roster;
        self.roster_event().into_iter().collect()
    }

    pub fn on_player_joined(&mut self, player_id: String) -> Vec<ClientEvent> {
        if self.current.is_none() || !self.roster.insert(player_id) {
            return Vec::new();
        }
        self.roster_event().into_iter().collect()
    }

    pub fn on_player_left(&mut self, player_id: &str) -> Vec<ClientEvent> {
        if self.current.is_none() || !self.roster.remove(player_id) {
            return Vec::new();
        }
        if let Some(room) = self.current.as_mut() {
            if room.host.as_known() == Some(player_id) {
                warn!(room_id = %room.id, host = %player_id, "Host left the room");
                room.host = HostId::Unknown;
            }
        }
        self.roster_event().into_iter().collect()
    }

    /// Look up the local spawn. A missing entry is reported, never defaulted.
    pub fn on_game_started(
        &mut self,
        room_id: String,
        spawn_by_session: &HashMap<String, Vec3>,
    ) -> Vec<ClientEvent> {
        let Some(room) = self.current.as_mut() else {
            return vec![ClientEvent::error(
                ErrorKind::InvalidState,
                format!("GAME_STARTED for room '{room_id}' while not in a room"),
            )];
        };

        if !room_id.is_empty() && room_id != room.id {
            warn!(current = %room.id, started = %room_id, "GAME_STARTED names a different room");
        }
        room.game_started = true;

        let me = self.local_session.as_deref().unwrap_or_default();
        match spawn_by_session.get(me) {
            Some(spawn) => {
                room.spawn = Some(*spawn);
                info!(room_id = %room.id, x = spawn.x, y = spawn.y, z = spawn.z, "Game started");
                vec![ClientEvent::GameStarted {
                    room_id: room.id.clone(),
                    spawn: *spawn,
                }]
            }
            None => {
                warn!(
                    room_id = %room.id,
                    session_id = %me,
                    assigned = spawn_by_session.len(),
                    "GAME_STARTED without a spawn for this session"
                );
                vec![ClientEvent::error(
                    ErrorKind::Protocol,
                    format!("{} for session {me}", constants::ERR_SPAWN_MISSING),
                )]
            }
        }
    }

    /// Periodic roster refresh while in a room
    pub fn tick(&mut self, now: Instant) -> Option<Command> {
        let room = self.current.as_ref()?;
        let due = match self.last_refresh {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.refresh_interval,
        };
        if !due {
            return None;
        }
        self.last_refresh = Some(now);
        Some(Command::GetRoomPlayers {
            room_id: room.id.clone(),
        })
    }

    fn clear_room(&mut self) {
        self.current = None;
        self.roster.clear();
        self.pending_join = None;
        self.last_refresh = None;
    }

    /// Forget everything, including the local session and room-list cache
    pub fn reset(&mut self) {
        self.clear_room();
        self.room_cache.clear();
        self.local_session = None;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;

    fn controller() -> RoomController {
        let mut rooms = RoomController::new(&RoomConfig::default());
        rooms.set_local_session("me");
        rooms
    }

    fn room(id: &str, host: Option<&str>) -> RoomInfo {
        RoomInfo {
            id: id.into(),
            name: "Track".into(),
            host_id: host.map(str::to_string),
            ..RoomInfo::default()
        }
    }

    #[test]
    fn test_creator_is_host_without_host_field() {
        let mut rooms = controller();
        let events = rooms.on_room_created(room("r1", None), Instant::now());
        assert_eq!(rooms.host(), Some(&HostId::Known("me".into())));
        assert!(rooms.is_local_host());
        assert!(matches!(&events[0], ClientEvent::RoomCreated(r) if r.host_id.as_deref() == Some("me")));
        assert_eq!(rooms.roster(), vec!["me".to_string()]);
    }

    #[test]
    fn test_join_uses_cached_host() {
        let mut rooms = controller();
        rooms.on_room_list(vec![room("r1", Some("alice"))]);
        rooms.on_room_joined(room("r1", None), vec!["alice".into()], Instant::now());
        assert_eq!(rooms.host(), Some(&HostId::Known("alice".into())));
        assert_eq!(rooms.roster(), vec!["alice".to_string(), "me".to_string()]);
    }

    #[test]
    fn test_join_without_host_or_cache_is_unknown() {
        let mut rooms = controller();
        let events = rooms.on_room_joined(room("r9", None), vec![], Instant::now());
        assert_eq!(rooms.host(), Some(&HostId::Unknown));
        assert!(!rooms.is_local_host());
        match &events[0] {
            ClientEvent::RoomJoined(info) => assert_eq!(info.host_id.as_deref(), Some("unknown")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_literal_unknown_host_falls_through_to_cache() {
        let mut rooms = controller();
        rooms.on_room_list(vec![room("r1", Some("bob"))]);
        rooms.on_room_joined(room("r1", Some("unknown")), vec![], Instant::now());
        assert_eq!(rooms.host(), Some(&HostId::Known("bob".into())));
    }

    #[test]
    fn test_start_game_refused_for_known_other_host() {
        let mut rooms = controller();
        rooms.on_room_joined(room("r1", Some("alice")), vec![], Instant::now());
        assert!(matches!(rooms.start_game(), Err(ProtocolError::NotHost)));
    }

    #[test]
    fn test_start_game_allowed_when_host_unknown() {
        let mut rooms = controller();
        rooms.on_room_joined(room("r1", None), vec![], Instant::now());
        assert_eq!(rooms.start_game().unwrap(), Command::StartGame);
    }

    #[test]
    fn test_missing_spawn_is_an_error_event() {
        let mut rooms = controller();
        rooms.on_room_created(room("r1", None), Instant::now());
        let mut spawns = HashMap::new();
        spawns.insert("someone-else".to_string(), Vec3::new(1.0, 0.0, 0.0));
        let events = rooms.on_game_started("r1".into(), &spawns);
        match &events[..] {
            [ClientEvent::Error { kind, message }] => {
                assert_eq!(*kind, ErrorKind::Protocol);
                assert!(message.contains("spawn position missing"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rooms.current_room().unwrap().spawn, None);
    }

    #[test]
    fn test_roster_deltas_and_host_departure() {
        let mut rooms = controller();
        rooms.on_room_joined(room("r1", Some("alice")), vec!["alice".into()], Instant::now());
        assert_eq!(rooms.on_player_joined("carol".into()).len(), 1);
        assert!(rooms.on_player_joined("carol".into()).is_empty());
        rooms.on_player_left("alice");
        assert_eq!(rooms.host(), Some(&HostId::Unknown));
        assert_eq!(rooms.roster(), vec!["carol".to_string(), "me".to_string()]);
    }

    #[test]
    fn test_refresh_tick_only_in_room() {
        let mut rooms = controller();
        let t0 = Instant::now();
        assert!(rooms.tick(t0 + Duration::from_secs(10)).is_none());

        rooms.on_room_created(room("r1", None), t0);
        assert!(rooms.tick(t0 + Duration::from_secs(1)).is_none());
        assert_eq!(
            rooms.tick(t0 + Duration::from_secs(3)),
            Some(Command::GetRoomPlayers {
                room_id: "r1".into()
            })
        );
        assert!(rooms.tick(t0 + Duration::from_secs(4)).is_none());
    }

    #[test]
    fn test_leave_clears_state() {
        let mut rooms = controller();
        rooms.on_room_created(room("r1", None), Instant::now());
        let (cmd, event) = rooms.leave_room().unwrap();
        assert_eq!(cmd, Command::LeaveRoom);
        assert_eq!(event, ClientEvent::RoomLeft { room_id: "r1".into() });
        assert!(!rooms.in_room());
        assert!(rooms.roster().is_empty());
        assert!(rooms.leave_room().is_err());
    }
}
