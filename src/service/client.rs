//! # Relay Client Engine
//!
//! [`RelayClient`] is the caller-facing handle. Behind it one engine task owns the
//! [`Session`] and is its only mutator. Everything else talks to that task through
//! channels:
//!
//! ```text
//!  caller ──Request──┐
//!  line reader ──────┤
//!  datagram reader ──┼──> engine task (Session, writer) ──ClientEvent──> subscribers
//!  drain ticker ─────┘
//! ```
//!
//! The three I/O tasks belong to one connection and share a child cancellation token,
//! so a lost connection stops them without stopping the engine. Inputs carry a
//! connection generation; anything left over from a previous connection is ignored.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::codec::InboundLine;
use crate::error::{ProtocolError, Result};
use crate::protocol::codec;
use crate::protocol::message::{
    ClientEvent, Command, Credentials, ErrorKind, InboundEvent, Password, Quat, Vec3,
};
use crate::protocol::session::{Session, SessionSnapshot, WireMessage};
use crate::transport::datagram::{DatagramChannel, DecodeOutcome};
use crate::transport::reconnect::{connect_with_retry, RetryPolicy};
use crate::transport::tls::{LineReader, LineWriter, TlsTransport};
use crate::transport::Connector;
use crate::utils::metrics::{Metrics, MetricsSnapshot};
use crate::utils::timeout::SHUTDOWN_TIMEOUT;

/// Buffered events per subscriber before the slowest one starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

const INPUT_CHANNEL_CAPACITY: usize = 512;

const RECV_ERROR_BACKOFF_BASE: Duration = Duration::from_millis(50);
const RECV_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Caller operations, applied in order by the engine task
enum Request {
    Authenticate(Credentials),
    SubmitPassword(Password),
    CreateRoom(String),
    JoinRoom(String),
    LeaveRoom,
    StartGame,
    RoomPlayers,
    ListRooms,
    Relay { target_id: String, message: String },
    Ping,
    Position { position: Vec3, rotation: Quat },
    Input { steer: f32, throttle: f32, brake: f32 },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Disconnect(oneshot::Sender<()>),
}

enum InputKind {
    Line(InboundLine),
    ReadFailed(ProtocolError),
    Datagram(Vec<u8>),
    Tick,
}

struct EngineInput {
    generation: u64,
    kind: InputKind,
}

/// Writer side of the current connection
struct Link<S> {
    writer: LineWriter<S>,
    datagrams: Option<DatagramChannel>,
    cancel: CancellationToken,
}

struct EngineHandle {
    requests: mpsc::UnboundedSender<Request>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Client for the racing relay.
///
/// Commands are fire-and-forget: they are validated and queued by the engine, and
/// their outcome arrives as a [`ClientEvent`]. Subscribe before connecting to see
/// every event.
pub struct RelayClient<C: Connector = TlsTransport> {
    config: Arc<NetworkConfig>,
    connector: Arc<C>,
    events: broadcast::Sender<ClientEvent>,
    metrics: Arc<Metrics>,
    engine: Mutex<Option<EngineHandle>>,
}

impl RelayClient<TlsTransport> {
    /// Client that connects over TCP + TLS
    pub fn new(config: NetworkConfig) -> Result<Self> {
        Self::with_connector(config, TlsTransport)
    }
}

impl<C: Connector> RelayClient<C> {
    /// Client over a custom command-channel connector
    pub fn with_connector(config: NetworkConfig, connector: C) -> Result<Self> {
        config.validate_strict()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config: Arc::new(config),
            connector: Arc::new(connector),
            events,
            metrics: Arc::new(Metrics::new()),
            engine: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Register an observer. Dropping the receiver unregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Events as a stream. Events missed by a lagging consumer are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = ClientEvent> + Send + Unpin {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(missed, "Event stream lagged");
                None
            }
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        match self.engine.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|h| !h.task.is_finished()),
            Err(_) => false,
        }
    }

    /// Connect (with retries), read the welcome and start the engine.
    ///
    /// Returns the session id the relay assigned. Authentication is a separate step.
    #[instrument(skip(self), fields(addr = %self.config.client.command_addr()))]
    pub async fn connect(&self) -> Result<String> {
        if self.is_running() {
            return Err(ProtocolError::InvalidState("already connected".into()));
        }

        let cancel = CancellationToken::new();
        let (inputs_tx, inputs_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let mut engine = Engine {
            config: self.config.clone(),
            connector: self.connector.clone(),
            session: Session::new(&self.config),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
            link: None,
            generation: 0,
            inputs_tx,
            inputs_rx,
        };

        let session_id = engine.establish().await?;

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(engine.run(requests_rx));

        if let Ok(mut guard) = self.engine.lock() {
            if let Some(stale) = guard.replace(EngineHandle {
                requests,
                cancel,
                task,
            }) {
                stale.cancel.cancel();
            }
        }
        Ok(session_id)
    }

    fn send(&self, request: Request) -> Result<()> {
        let guard = self.engine.lock().map_err(|_| ProtocolError::EngineStopped)?;
        match guard.as_ref() {
            Some(handle) if handle.requests.send(request).is_ok() => Ok(()),
            _ => Err(ProtocolError::EngineStopped),
        }
    }

    /// Send `NAME` with the caller's credentials
    pub fn authenticate(&self, credentials: Credentials) -> Result<()> {
        self.send(Request::Authenticate(credentials))
    }

    /// Send `AUTHENTICATE` after the relay asked for a password
    pub fn submit_password(&self, password: Password) -> Result<()> {
        self.send(Request::SubmitPassword(password))
    }

    pub fn create_room(&self, name: impl Into<String>) -> Result<()> {
        self.send(Request::CreateRoom(name.into()))
    }

    pub fn join_room(&self, room_id: impl Into<String>) -> Result<()> {
        self.send(Request::JoinRoom(room_id.into()))
    }

    pub fn leave_room(&self) -> Result<()> {
        self.send(Request::LeaveRoom)
    }

    /// Host only; refused locally when another player is known to be host
    pub fn start_game(&self) -> Result<()> {
        self.send(Request::StartGame)
    }

    pub fn request_room_players(&self) -> Result<()> {
        self.send(Request::RoomPlayers)
    }

    pub fn list_rooms(&self) -> Result<()> {
        self.send(Request::ListRooms)
    }

    pub fn relay_message(&self, target_id: impl Into<String>, message: impl Into<String>) -> Result<()> {
        self.send(Request::Relay {
            target_id: target_id.into(),
            message: message.into(),
        })
    }

    pub fn ping(&self) -> Result<()> {
        self.send(Request::Ping)
    }

    /// Offer a position update; it may be dropped by the datagram rate limit
    pub fn send_position_update(&self, position: Vec3, rotation: Quat) -> Result<()> {
        self.send(Request::Position { position, rotation })
    }

    /// Offer an input update; it may be dropped by the datagram rate limit
    pub fn send_input_update(&self, steer: f32, throttle: f32, brake: f32) -> Result<()> {
        self.send(Request::Input {
            steer,
            throttle,
            brake,
        })
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Snapshot(tx))?;
        rx.await.map_err(|_| ProtocolError::EngineStopped)
    }

    /// Best-effort `BYE`, then close both channels and stop the engine.
    /// Queued outbound messages are discarded. Idempotent.
    pub async fn disconnect(&self) {
        let handle = match self.engine.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.requests.send(Request::Disconnect(ack_tx)).is_ok() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT * 2, ack_rx).await;
        }
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!(error = %e, "Engine task ended abnormally");
        }
    }
}

impl<C: Connector> Drop for RelayClient<C> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.engine.lock() {
            if let Some(handle) = guard.take() {
                handle.cancel.cancel();
            }
        }
    }
}

/// The single mutator of one client's session
struct Engine<C: Connector> {
    config: Arc<NetworkConfig>,
    connector: Arc<C>,
    session: Session,
    events: broadcast::Sender<ClientEvent>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    link: Option<Link<C::Stream>>,
    generation: u64,
    inputs_tx: mpsc::Sender<EngineInput>,
    inputs_rx: mpsc::Receiver<EngineInput>,
}

impl<C: Connector> Engine<C> {
    fn publish(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Forward everything the session produced
    fn flush_events(&mut self) {
        for event in self.session.take_events() {
            trace!(?event, "Event");
            let _ = self.events.send(event);
        }
    }

    /// Connect with retries and start the I/O tasks for the new connection
    async fn establish(&mut self) -> Result<String> {
        self.session.begin_connect()?;
        self.flush_events();

        let policy = RetryPolicy::from_config(&self.config.client);
        let connector = self.connector.clone();
        let client_config = self.config.client.clone();
        let metrics = self.metrics.clone();

        let result = connect_with_retry(&policy, &self.cancel, |attempt| {
            if attempt > 0 {
                metrics.reconnect_attempt();
            }
            let open = connector.open(client_config.clone());
            let metrics = metrics.clone();
            async move {
                let result = open.await;
                if let Err(e) = &result {
                    metrics.connect_failed();
                    debug!(attempt = attempt + 1, error = %e, "Connect attempt failed");
                }
                result
            }
        })
        .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(exhausted) if exhausted.cancelled => {
                self.session.disconnect("cancelled");
                self.flush_events();
                return Err(ProtocolError::EngineStopped);
            }
            Err(exhausted) => {
                self.session
                    .connect_failed(exhausted.attempts, &exhausted.last_error);
                self.flush_events();
                return Err(ProtocolError::Connect(exhausted.last_error));
            }
        };

        self.metrics.connection_established();
        let now = Instant::now();
        self.session.transport_opened(now);
        self.session.handle(
            InboundEvent::Connected {
                session_id: raw.session_id.clone(),
            },
            now,
        );
        self.flush_events();

        let datagrams = match DatagramChannel::open(
            &self.config.client.datagram_addr(),
            self.config.datagram.max_packet_size,
        )
        .await
        {
            Ok(channel) => Some(channel),
            Err(e) => {
                warn!(error = %e, "Datagram channel unavailable");
                self.publish(ClientEvent::error(
                    ErrorKind::Transport,
                    format!("datagram channel unavailable: {e}"),
                ));
                None
            }
        };

        self.generation += 1;
        let link_cancel = self.cancel.child_token();
        let (reader, writer) = raw.connection.into_split();

        tokio::spawn(read_loop(
            reader,
            self.inputs_tx.clone(),
            self.generation,
            link_cancel.clone(),
        ));
        if let Some(channel) = &datagrams {
            tokio::spawn(datagram_loop(
                channel.clone(),
                self.inputs_tx.clone(),
                self.generation,
                link_cancel.clone(),
            ));
        }
        tokio::spawn(tick_loop(
            self.config.dispatch.tick_interval,
            self.inputs_tx.clone(),
            self.generation,
            link_cancel.clone(),
        ));

        self.link = Some(Link {
            writer,
            datagrams,
            cancel: link_cancel,
        });
        Ok(raw.session_id)
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.shutdown("client disconnect", false).await;
                    break;
                }
                request = requests.recv() => match request {
                    Some(Request::Disconnect(ack)) => {
                        self.shutdown("client disconnect", true).await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        self.shutdown("client dropped", true).await;
                        break;
                    }
                },
                Some(input) = self.inputs_rx.recv() => {
                    if !self.handle_input(input).await {
                        break;
                    }
                }
            }
        }
        self.metrics.log_metrics();
        debug!("Engine stopped");
    }

    fn handle_request(&mut self, request: Request) {
        let now = Instant::now();
        let result = match request {
            Request::Authenticate(credentials) => self.session.authenticate(credentials, now),
            Request::SubmitPassword(password) => self.session.submit_password(password, now),
            Request::CreateRoom(name) => self.session.create_room(&name, now),
            Request::JoinRoom(room_id) => self.session.join_room(&room_id, now),
            Request::LeaveRoom => self.session.leave_room(now),
            Request::StartGame => self.session.start_game(now),
            Request::RoomPlayers => self.session.request_room_players(now),
            Request::ListRooms => self.session.list_rooms(now),
            Request::Relay { target_id, message } => {
                self.session.relay_message(&target_id, &message, now)
            }
            Request::Ping => self.session.ping(now),
            Request::Position { position, rotation } => self
                .session
                .send_position(position, rotation, now)
                .map(|queued| self.note_rate_limit(queued)),
            Request::Input {
                steer,
                throttle,
                brake,
            } => self
                .session
                .send_input(steer, throttle, brake, now)
                .map(|queued| self.note_rate_limit(queued)),
            Request::Snapshot(reply) => {
                let _ = reply.send(self.session.snapshot());
                Ok(())
            }
            Request::Disconnect(ack) => {
                let _ = ack.send(());
                Ok(())
            }
        };

        if let Err(e) = result {
            let kind = match &e {
                ProtocolError::InvalidState(_) | ProtocolError::NotHost => ErrorKind::InvalidState,
                ProtocolError::Transport(_) | ProtocolError::Io(_) => ErrorKind::Transport,
                ProtocolError::Auth(_) => ErrorKind::Auth,
                _ => ErrorKind::Protocol,
            };
            debug!(error = %e, "Request rejected");
            self.publish(ClientEvent::error(kind, e.to_string()));
        }
        self.flush_events();
    }

    fn note_rate_limit(&self, queued: bool) {
        if !queued {
            self.metrics.datagram_rate_limited();
        }
    }

    /// Returns `false` when the engine should stop
    async fn handle_input(&mut self, input: EngineInput) -> bool {
        if input.generation != self.generation {
            trace!(stale = input.generation, current = self.generation, "Stale input ignored");
            return true;
        }

        let now = Instant::now();
        match input.kind {
            InputKind::Line(InboundLine::Text(text)) => {
                self.metrics.line_received();
                let event = codec::decode_line(&text);
                if matches!(
                    event,
                    InboundEvent::ParseError { .. } | InboundEvent::UnknownCommand { .. }
                ) {
                    self.metrics.parse_error();
                }
                self.session.handle(event, now);
                self.flush_events();
                true
            }
            InputKind::Line(InboundLine::Oversized(len)) => {
                self.metrics.line_received();
                self.metrics.parse_error();
                self.session.handle(
                    InboundEvent::ParseError {
                        reason: format!("line of {len} bytes exceeds limit"),
                        raw: String::new(),
                    },
                    now,
                );
                self.flush_events();
                true
            }
            InputKind::Datagram(bytes) => {
                self.metrics.datagram_received();
                let before = self.session.datagram_stats();
                let outcome = self.session.handle_datagram(&bytes, now);
                let after = self.session.datagram_stats();
                for _ in before.decrypt_failures..after.decrypt_failures {
                    self.metrics.decrypt_failure();
                }
                match outcome {
                    DecodeOutcome::Decrypted(_) => {}
                    DecodeOutcome::Plaintext(_) => self.metrics.plaintext_fallback(),
                    DecodeOutcome::Dropped => self.metrics.datagram_dropped(),
                }
                self.flush_events();
                true
            }
            InputKind::Tick => self.flush_outbound().await,
            InputKind::ReadFailed(e) => {
                let reason = match e {
                    ProtocolError::ConnectionClosed => "connection closed by relay".to_string(),
                    ProtocolError::Timeout => "read timeout".to_string(),
                    other => other.to_string(),
                };
                self.connection_lost(reason).await
            }
        }
    }

    /// Write whatever the dispatcher releases now
    async fn flush_outbound(&mut self) -> bool {
        let due = self.session.poll_outbound(Instant::now());

        for message in due {
            match self.session.encode(&message) {
                Ok(WireMessage::Line(line)) => {
                    let Some(link) = self.link.as_mut() else {
                        break;
                    };
                    if let Err(e) = link.writer.write_line(&line).await {
                        return self.connection_lost(format!("write failed: {e}")).await;
                    }
                    self.metrics.command_sent();
                }
                Ok(WireMessage::Datagram(bytes)) => {
                    let Some(channel) = self.link.as_ref().and_then(|l| l.datagrams.as_ref()) else {
                        self.metrics.datagram_dropped();
                        continue;
                    };
                    match channel.send(&bytes).await {
                        Ok(()) => self.metrics.datagram_sent(),
                        Err(e) => {
                            self.metrics.datagram_dropped();
                            debug!(error = %e, "Datagram send failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Could not encode outbound message");
                    self.publish(ClientEvent::error(ErrorKind::Protocol, e.to_string()));
                }
            }
        }

        self.flush_events();
        true
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.cancel.cancel();
            link.writer.close().await;
        }
    }

    /// Tear down after a transport failure and reconnect if configured
    async fn connection_lost(&mut self, reason: String) -> bool {
        warn!(%reason, "Connection lost");
        self.close_link().await;
        self.session.disconnect(&reason);
        self.flush_events();

        if !self.config.client.auto_reconnect {
            return false;
        }

        match self.establish().await {
            Ok(session_id) => {
                info!(session_id = %session_id, "Reconnected, authentication required");
                true
            }
            Err(e) => {
                debug!(error = %e, "Reconnect abandoned");
                false
            }
        }
    }

    async fn shutdown(&mut self, reason: &str, send_bye: bool) {
        if send_bye && self.session.state().is_connected() {
            if let (Some(link), Ok(line)) = (self.link.as_mut(), codec::encode_command(&Command::Bye)) {
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, link.writer.write_line(&line)).await {
                    Ok(Ok(())) => debug!("BYE sent"),
                    Ok(Err(e)) => debug!(error = %e, "BYE not sent"),
                    Err(_) => debug!("BYE timed out"),
                }
            }
        }
        self.close_link().await;
        self.session.disconnect(reason);
        self.flush_events();
    }
}

async fn read_loop<S: AsyncRead>(
    mut reader: LineReader<S>,
    inputs: mpsc::Sender<EngineInput>,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        let kind = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read_line() => match result {
                Ok(line) => InputKind::Line(line),
                Err(e) => {
                    let _ = inputs.send(EngineInput { generation, kind: InputKind::ReadFailed(e) }).await;
                    break;
                }
            },
        };
        if inputs.send(EngineInput { generation, kind }).await.is_err() {
            break;
        }
    }
    trace!(generation, "Line reader stopped");
}

async fn datagram_loop(
    channel: DatagramChannel,
    inputs: mpsc::Sender<EngineInput>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut consecutive_errors = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = channel.recv() => match result {
                Ok(bytes) => {
                    consecutive_errors = 0;
                    if inputs.send(EngineInput { generation, kind: InputKind::Datagram(bytes) }).await.is_err() {
                        break;
                    }
                }
                // ICMP errors on a connected socket surface here; not fatal
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = recv_error_backoff(consecutive_errors);
                    debug!(error = %e, attempt = consecutive_errors, ?delay, "Datagram receive error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
        }
    }
    trace!(generation, "Datagram reader stopped");
}

/// Pause before retrying `recv` after the given number of consecutive errors.
fn recv_error_backoff(consecutive_errors: u32) -> Duration {
    let shift = consecutive_errors.saturating_sub(1).min(5);
    RECV_ERROR_BACKOFF_BASE
        .saturating_mul(1 << shift)
        .min(RECV_ERROR_BACKOFF_MAX)
}

async fn tick_loop(
    period: Duration,
    inputs: mpsc::Sender<EngineInput>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match inputs.try_send(EngineInput { generation, kind: InputKind::Tick }) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
    trace!(generation, "Drain ticker stopped");
}
