// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::protocol::codec::decode_line;
use crate::protocol::dispatcher::Outbound;
use crate::protocol::message::{ClientEvent, Command, Credentials, ErrorKind, HostId, Vec3};
use crate::protocol::session::{Session, SessionState, WireMessage};

/// Feed raw relay lines through codec and session, as the engine does
fn feed(session: &mut Session, lines: &[&str], now: Instant) -> Vec<ClientEvent> {
    for line in lines {
        session.handle(decode_line(line), now);
    }
    session.take_events()
}

/// Written lines, in order, until the queue is empty
fn written_lines(session: &mut Session, start: Instant) -> Vec<String> {
    let mut lines = Vec::new();
    let mut now = start;
    for _ in 0..32 {
        for msg in session.poll_outbound(now) {
            if let WireMessage::Line(line) = session.encode(&msg).unwrap() {
                lines.push(line);
            }
        }
        now += Duration::from_millis(100);
    }
    lines
}

fn welcomed(id: &str) -> (Session, Instant) {
    let mut session = Session::new(&NetworkConfig::default());
    let now = Instant::now();
    session.begin_connect().unwrap();
    session.transport_opened(now);
    feed(&mut session, &[&format!("CONNECTED|{id}")], now);
    (session, now)
}

#[test]
fn test_login_flow_pipe_welcome_json_auth() {
    let (mut session, now) = welcomed("abc123");
    assert_eq!(session.state(), SessionState::Authenticating);

    session
        .authenticate(Credentials::new("Bob", "x"), now)
        .unwrap();
    let lines = written_lines(&mut session, now);
    let name: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(name["command"], "NAME");
    assert_eq!(name["name"], "Bob");
    assert_eq!(name["password"], "x");

    let events = feed(
        &mut session,
        &[r#"{"command":"NAME_OK","authenticated":true,"udpEncryption":true}"#],
        now,
    );
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.crypto().unwrap().session_id(), "abc123");
    assert!(events.contains(&ClientEvent::AuthChanged {
        authenticated: true,
        reason: None
    }));

    let lines = written_lines(&mut session, now + Duration::from_secs(5));
    assert_eq!(lines[0], r#"{"command":"PLAYER_INFO"}"#);
}

#[test]
fn test_pipe_auth_without_encryption() {
    let (mut session, now) = welcomed("s1");
    feed(&mut session, &["NAME_OK|true|false"], now);
    assert_eq!(session.state(), SessionState::Authenticated);
    assert!(session.crypto().is_none());
}

#[test]
fn test_auth_failed_keeps_authenticating() {
    let (mut session, now) = welcomed("s1");
    let events = feed(&mut session, &["AUTH_FAILED|Invalid password"], now);
    assert_eq!(session.state(), SessionState::Authenticating);
    assert_eq!(
        events,
        vec![ClientEvent::AuthChanged {
            authenticated: false,
            reason: Some("Invalid password".into())
        }]
    );
}

#[test]
fn test_truncated_json_then_recovery() {
    let (mut session, now) = welcomed("s1");
    let events = feed(
        &mut session,
        &[r#"{"command":"NAME_OK","authen"#, "NAME_OK|true|true"],
        now,
    );
    assert!(matches!(
        events[0],
        ClientEvent::Error {
            kind: ErrorKind::Parse,
            ..
        }
    ));
    assert_eq!(session.state(), SessionState::Authenticated);
}

#[test]
fn test_room_lifecycle_over_mixed_formats() {
    let (mut session, now) = welcomed("me");
    feed(&mut session, &["NAME_OK|true|true"], now);

    feed(
        &mut session,
        &["ROOM_LIST|room_1|Monza|alice|2/8|room_2|Spa|bob|1/4"],
        now,
    );
    assert_eq!(session.rooms().cached_rooms().count(), 2);
    session.join_room("room_2", now).unwrap();
    let events = feed(
        &mut session,
        &[r#"{"command":"JOIN_OK","roomId":"room_2","players":["bob"]}"#],
        now,
    );
    assert_eq!(session.state(), SessionState::InRoom);
    assert_eq!(
        session.rooms().host(),
        Some(&HostId::Known("bob".into()))
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::RoomJoined(room) if room.name == "Spa")));

    assert!(session.start_game(now).is_err());

    feed(&mut session, &["PLAYER_JOINED|carol", "PLAYER_LEFT|bob"], now);
    assert_eq!(session.rooms().roster(), vec!["carol".to_string(), "me".to_string()]);
    assert_eq!(session.rooms().host(), Some(&HostId::Unknown));
}

#[test]
fn test_game_started_pipe_spawn_lookup() {
    let (mut session, now) = welcomed("me");
    feed(&mut session, &["NAME_OK|true|true", "ROOM_CREATED|r1|Track"], now);

    let events = feed(
        &mut session,
        &["GAME_STARTED|r1|other:1,0,0|me:10.5,0,-3"],
        now,
    );
    assert_eq!(
        events,
        vec![ClientEvent::GameStarted {
            room_id: "r1".into(),
            spawn: Vec3::new(10.5, 0.0, -3.0)
        }]
    );
}

#[test]
fn test_game_started_without_local_spawn() {
    let (mut session, now) = welcomed("me");
    feed(&mut session, &["NAME_OK|true|true", "ROOM_CREATED|r1|Track"], now);
    let events = feed(&mut session, &["GAME_STARTED|r1|other:1,0,0"], now);
    assert!(matches!(
        &events[..],
        [ClientEvent::Error { kind: ErrorKind::Protocol, message }] if message.contains("spawn position missing")
    ));
}

#[test]
fn test_relayed_text_keeps_pipes() {
    let (mut session, now) = welcomed("me");
    feed(&mut session, &["NAME_OK|true|true"], now);
    let events = feed(&mut session, &["RELAYED_MESSAGE|s2|Alice|a|b|c"], now);
    assert_eq!(
        events,
        vec![ClientEvent::MessageReceived {
            sender_id: "s2".into(),
            sender_name: "Alice".into(),
            text: "a|b|c".into()
        }]
    );
}

#[test]
fn test_commands_are_spaced_by_interval() {
    let (mut session, now) = welcomed("me");
    feed(&mut session, &["NAME_OK|true|true"], now);
    session.list_rooms(now).unwrap();
    session.ping(now).unwrap();

    let first = session.poll_outbound(now);
    assert_eq!(first.len(), 1);
    assert!(session.poll_outbound(now + Duration::from_millis(99)).is_empty());
    let second = session.poll_outbound(now + Duration::from_millis(100));
    assert_eq!(second[0].payload, Outbound::Command(Command::ListRooms));
}

#[test]
fn test_leave_room_returns_to_authenticated() {
    let (mut session, now) = welcomed("me");
    feed(&mut session, &["NAME_OK|true|true", "ROOM_CREATED|r1|Track"], now);
    session.leave_room(now).unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    assert!(session
        .take_events()
        .contains(&ClientEvent::RoomLeft { room_id: "r1".into() }));
}
