//! End-to-end tests for the client engine
//!
//! The command channel runs over in-memory duplex streams with a scripted relay on
//! the far end; the datagram channel uses a real loopback UDP socket.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use relay_client::config::{ClientConfig, NetworkConfig, DEFAULT_SHARED_SECRET};
use relay_client::error::{ConnectError, ProtocolError};
use relay_client::transport::datagram::{DatagramCodec, DecodeOutcome};
use relay_client::transport::tls::{LineConnection, RawConnection};
use relay_client::utils::crypto::SessionCipher;
use relay_client::{
    ClientEvent, Connector, Credentials, ErrorKind, Quat, RelayClient, SessionState, Vec3,
};
use serde_json::{json, Value};
use serial_test::serial;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

/// Hands the relay end of every new connection to the test
struct DuplexConnector {
    relay_ends: mpsc::UnboundedSender<DuplexStream>,
    opened: Arc<AtomicU32>,
}

impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    fn open(
        &self,
        config: ClientConfig,
    ) -> BoxFuture<'static, std::result::Result<RawConnection<DuplexStream>, ConnectError>> {
        let relay_ends = self.relay_ends.clone();
        self.opened.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let (client_end, relay_end) = tokio::io::duplex(64 * 1024);
            relay_ends.send(relay_end).map_err(|_| ConnectError::Refused)?;
            let mut connection =
                LineConnection::new(client_end, config.read_timeout, config.write_timeout);
            let session_id = connection.read_welcome().await?;
            Ok(RawConnection {
                session_id,
                connection,
            })
        })
    }
}

/// Always fails with the given error
struct FailingConnector {
    error: ConnectError,
    calls: Arc<AtomicU32>,
}

impl Connector for FailingConnector {
    type Stream = DuplexStream;

    fn open(
        &self,
        _config: ClientConfig,
    ) -> BoxFuture<'static, std::result::Result<RawConnection<DuplexStream>, ConnectError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }
}

/// Scripted relay side of one connection
struct FakeRelay {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeRelay {
    async fn accept(ends: &mut mpsc::UnboundedReceiver<DuplexStream>, session_id: &str) -> Self {
        let stream = tokio::time::timeout(WAIT, ends.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped");
        let (read, writer) = tokio::io::split(stream);
        let mut relay = Self {
            lines: BufReader::new(read).lines(),
            writer,
        };
        relay.send(&format!("CONNECTED|{session_id}")).await;
        relay
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    /// Next command the client wrote, skipping keepalives
    async fn next_command(&mut self) -> Option<Value> {
        loop {
            let line = tokio::time::timeout(WAIT, self.lines.next_line())
                .await
                .expect("client went quiet")
                .unwrap()?;
            let value: Value = serde_json::from_str(&line).expect("client wrote invalid JSON");
            if value["command"] != "PING" {
                return Some(value);
            }
        }
    }

    async fn expect_command(&mut self, name: &str) -> Value {
        let value = self.next_command().await.expect("connection closed");
        assert_eq!(value["command"], name, "unexpected command {value}");
        value
    }
}

fn test_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.client.max_retry_attempts = 3;
        c.client.retry_base_delay = Duration::from_millis(20);
        c.client.retry_max_delay = Duration::from_millis(100);
    })
}

fn duplex_client(
    config: NetworkConfig,
) -> (
    RelayClient<DuplexConnector>,
    mpsc::UnboundedReceiver<DuplexStream>,
    Arc<AtomicU32>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let opened = Arc::new(AtomicU32::new(0));
    let client = RelayClient::with_connector(
        config,
        DuplexConnector {
            relay_ends: tx,
            opened: opened.clone(),
        },
    )
    .expect("valid config");
    (client, rx, opened)
}

/// Wait for the first event matching `pred`
async fn wait_for<F>(events: &mut broadcast::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

/// Connect, answer the login and drain PLAYER_INFO
async fn logged_in(
    config: NetworkConfig,
    udp_encryption: bool,
) -> (
    RelayClient<DuplexConnector>,
    FakeRelay,
    broadcast::Receiver<ClientEvent>,
    mpsc::UnboundedReceiver<DuplexStream>,
) {
    let (client, mut ends, _) = duplex_client(config);
    let mut events = client.subscribe();

    let (session_id, mut relay) = tokio::join!(client.connect(), FakeRelay::accept(&mut ends, "abc123"));
    assert_eq!(session_id.unwrap(), "abc123");

    client.authenticate(Credentials::new("Bob", "hunter2")).unwrap();
    let name = relay.expect_command("NAME").await;
    assert_eq!(name["name"], "Bob");
    assert_eq!(name["password"], "hunter2");

    relay
        .send(&format!("NAME_OK|true|{udp_encryption}"))
        .await;
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::AuthChanged { authenticated: true, .. })
    })
    .await;
    relay.expect_command("PLAYER_INFO").await;

    (client, relay, events, ends)
}

#[tokio::test]
async fn test_connect_and_authenticate() {
    let (client, mut ends, _) = duplex_client(test_config());
    let mut events = client.subscribe();

    let (session_id, _relay) =
        tokio::join!(client.connect(), FakeRelay::accept(&mut ends, "abc123"));
    assert_eq!(session_id.unwrap(), "abc123");
    assert!(client.is_running());

    let connected = wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert_eq!(
        connected,
        ClientEvent::Connected {
            session_id: "abc123".into()
        }
    );

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Authenticating);
    assert_eq!(snapshot.session_id.as_deref(), Some("abc123"));
    assert!(!snapshot.authenticated);

    client.disconnect().await;
}

#[tokio::test]
async fn test_room_flow_over_engine() {
    let (client, mut relay, mut events, _ends) = logged_in(test_config(), false).await;

    client.create_room("Fun").unwrap();
    let create = relay.expect_command("CREATE_ROOM").await;
    assert_eq!(create["name"], "Fun");

    relay.send("ROOM_CREATED|room_1|Fun").await;
    let created = wait_for(&mut events, |e| matches!(e, ClientEvent::RoomCreated(_))).await;
    let ClientEvent::RoomCreated(room) = created else {
        unreachable!()
    };
    assert_eq!(room.id, "room_1");

    relay.send("PLAYER_JOINED|carol").await;
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::RosterChanged { players, .. } if players.len() == 2)
    })
    .await;

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::InRoom);
    assert_eq!(snapshot.players, vec!["abc123".to_string(), "carol".to_string()]);

    client.start_game().unwrap();
    relay.expect_command("START_GAME").await;
    relay
        .send(r#"{"command":"GAME_STARTED","roomId":"room_1","spawnPositions":{"abc123":{"x":4,"y":0,"z":2}}}"#)
        .await;
    let started = wait_for(&mut events, |e| matches!(e, ClientEvent::GameStarted { .. })).await;
    assert_eq!(
        started,
        ClientEvent::GameStarted {
            room_id: "room_1".into(),
            spawn: Vec3::new(4.0, 0.0, 2.0)
        }
    );

    client.leave_room().unwrap();
    relay.expect_command("LEAVE_ROOM").await;
    wait_for(&mut events, |e| matches!(e, ClientEvent::RoomLeft { .. })).await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_rejected_request_becomes_error_event() {
    let (client, mut ends, _) = duplex_client(test_config());
    let mut events = client.subscribe();
    let (result, _relay) = tokio::join!(client.connect(), FakeRelay::accept(&mut ends, "s1"));
    result.unwrap();

    client.create_room("too early").unwrap();
    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Error { .. })).await;
    assert!(matches!(
        event,
        ClientEvent::Error {
            kind: ErrorKind::InvalidState,
            ..
        }
    ));
    client.disconnect().await;
}

#[tokio::test]
async fn test_relayed_message_and_ping() {
    let (client, mut relay, mut events, _ends) = logged_in(test_config(), false).await;

    client.relay_message("s2", "hi|there").unwrap();
    let relayed = relay.expect_command("RELAY_MESSAGE").await;
    assert_eq!(relayed["targetId"], "s2");
    assert_eq!(relayed["message"], "hi|there");

    relay.send("RELAYED_MESSAGE|s2|Alice|back|at|you").await;
    let received =
        wait_for(&mut events, |e| matches!(e, ClientEvent::MessageReceived { .. })).await;
    assert_eq!(
        received,
        ClientEvent::MessageReceived {
            sender_id: "s2".into(),
            sender_name: "Alice".into(),
            text: "back|at|you".into()
        }
    );

    client.ping().unwrap();
    let line = tokio::time::timeout(WAIT, relay.lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(line.contains("\"PING\""));
    relay.send("PONG").await;
    wait_for(&mut events, |e| matches!(e, ClientEvent::LatencyUpdated { .. })).await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_sends_bye_and_stops() {
    let (client, mut relay, mut events, _ends) = logged_in(test_config(), false).await;

    client.disconnect().await;
    relay.expect_command("BYE").await;
    assert!(relay.next_command().await.is_none());

    wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert!(!client.is_running());
    assert!(matches!(
        client.list_rooms(),
        Err(ProtocolError::EngineStopped)
    ));
    assert!(client.snapshot().await.is_err());

    // Idempotent
    client.disconnect().await;
}

#[tokio::test]
async fn test_operations_before_connect_fail() {
    let (client, _ends, _) = duplex_client(test_config());
    assert!(matches!(
        client.authenticate(Credentials::new("a", "b")),
        Err(ProtocolError::EngineStopped)
    ));
    assert!(matches!(
        client.snapshot().await,
        Err(ProtocolError::EngineStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_single_connection_failed_after_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let client = RelayClient::with_connector(
        test_config(),
        FailingConnector {
            error: ConnectError::Refused,
            calls: calls.clone(),
        },
    )
    .unwrap();
    let mut events = client.subscribe();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ProtocolError::Connect(ConnectError::Refused)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!client.is_running());

    let mut failures = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::ConnectionFailed { attempts, .. } = event {
            failures.push(attempts);
        }
    }
    assert_eq!(failures, vec![3]);

    let metrics = client.metrics();
    assert_eq!(metrics.connect_failures, 3);
    assert_eq!(metrics.reconnect_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_certificate_rejection_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let client = RelayClient::with_connector(
        test_config(),
        FailingConnector {
            error: ConnectError::CertificateRejected("thumbprint mismatch".into()),
            calls: calls.clone(),
        },
    )
    .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Connect(ConnectError::CertificateRejected(_))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn test_reconnect_requires_new_login() {
    let (client, relay, mut events, mut ends) = logged_in(test_config(), true).await;

    drop(relay);
    wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;

    let _second = FakeRelay::accept(&mut ends, "second").await;
    let connected = wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert_eq!(
        connected,
        ClientEvent::Connected {
            session_id: "second".into()
        }
    );

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Authenticating);
    assert!(!snapshot.authenticated);
    assert!(!snapshot.udp_encrypted);
    assert!(client.metrics().connections_total >= 2);

    client.disconnect().await;
}

#[tokio::test]
#[serial]
async fn test_lost_connection_without_auto_reconnect_stops_engine() {
    let config = NetworkConfig::default_with_overrides(|c| c.client.auto_reconnect = false);
    let (client, relay, mut events, _ends) = logged_in(config, false).await;

    drop(relay);
    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert!(matches!(event, ClientEvent::Disconnected { reason } if reason.contains("closed")));

    tokio::time::timeout(WAIT, async {
        while client.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("engine kept running");
    assert!(client.ping().is_err());
}

#[tokio::test]
#[serial]
async fn test_encrypted_datagrams_both_directions() {
    let udp_relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = udp_relay.local_addr().unwrap().port();
    let config = NetworkConfig::default_with_overrides(|c| {
        c.client.host = "127.0.0.1".into();
        c.client.datagram_port = port;
    });
    let (client, _relay, mut events, _ends) = logged_in(config, true).await;

    client
        .send_position_update(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY)
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let (len, client_addr) = tokio::time::timeout(WAIT, udp_relay.recv_from(&mut buf))
        .await
        .expect("no datagram")
        .unwrap();

    let mut codec = DatagramCodec::new(Some(SessionCipher::derive("abc123", DEFAULT_SHARED_SECRET)));
    let DecodeOutcome::Decrypted(update) = codec.decode_detailed(&buf[..len]) else {
        panic!("datagram was not encrypted with the session key");
    };
    assert_eq!(update["command"], "UPDATE");
    assert_eq!(update["sessionId"], "abc123");
    assert_eq!(update["position"]["y"], 2.0);

    let inbound = codec
        .encode(&json!({
            "command": "UPDATE",
            "sessionId": "other",
            "position": {"x": 9.0, "y": 0.0, "z": 1.0},
            "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0}
        }))
        .unwrap();
    udp_relay.send_to(&inbound, client_addr).await.unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::PlayerPositionUpdate { .. })
    })
    .await;
    let ClientEvent::PlayerPositionUpdate {
        session_id,
        position,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(session_id, "other");
    assert_eq!(position, Vec3::new(9.0, 0.0, 1.0));

    // Legacy peers send plain JSON
    let plain = json!({
        "command": "INPUT",
        "sessionId": "legacy",
        "input": {"steering": 0.5, "throttle": 1.0, "brake": 0.0, "timestamp": 7}
    })
    .to_string();
    udp_relay.send_to(plain.as_bytes(), client_addr).await.unwrap();
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::PlayerInputUpdate { .. })
    })
    .await;
    assert!(matches!(
        event,
        ClientEvent::PlayerInputUpdate { session_id, timestamp: 7, .. } if session_id == "legacy"
    ));

    // Own echoes are filtered
    let echo = codec
        .encode(&json!({
            "command": "UPDATE",
            "sessionId": "abc123",
            "position": {"x": 0.0, "y": 0.0, "z": 0.0}
        }))
        .unwrap();
    udp_relay.send_to(&echo, client_addr).await.unwrap();

    // Neither ciphertext nor JSON
    let mut garbage = 5u32.to_le_bytes().to_vec();
    garbage.extend_from_slice(b"not json");
    udp_relay.send_to(&garbage, client_addr).await.unwrap();

    let metrics = tokio::time::timeout(WAIT, async {
        loop {
            let m = client.metrics();
            if m.datagrams_received >= 4 && m.datagrams_dropped >= 1 {
                return m;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(metrics.datagrams_sent, 1);
    assert_eq!(metrics.plaintext_fallbacks, 1);
    assert_eq!(metrics.decrypt_failures, 2);
    assert_eq!(metrics.datagrams_dropped, 1);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(&event, ClientEvent::PlayerPositionUpdate { session_id, .. } if session_id == "abc123"),
            "own echo surfaced"
        );
    }

    client.disconnect().await;
}

#[tokio::test]
async fn test_event_stream_yields_events() {
    use tokio_stream::StreamExt;

    let (client, mut ends, _) = duplex_client(test_config());
    let mut stream = client.event_stream();
    let (result, _relay) = tokio::join!(client.connect(), FakeRelay::accept(&mut ends, "s7"));
    result.unwrap();

    let connected = tokio::time::timeout(WAIT, async {
        while let Some(event) = stream.next().await {
            if let ClientEvent::Connected { session_id } = event {
                return session_id;
            }
        }
        panic!("stream ended");
    })
    .await
    .unwrap();
    assert_eq!(connected, "s7");
    client.disconnect().await;
}
