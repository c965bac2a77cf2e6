//! # TLS Command Channel
//!
//! Newline-delimited text over TLS.
//!
//! Opening a connection is three steps, bounded as a whole by the connect timeout:
//! 1. TCP connect to the relay's command port
//! 2. TLS handshake, verifying the server per [`TrustMode`]
//! 3. Read exactly one welcome line, `CONNECTED|<session_id>`
//!
//! Failures come back as [`ConnectError`]; nothing here retries. Once open, the
//! connection splits into a [`LineReader`] for the reader task and a [`LineWriter`] for
//! the engine, each with its own timeout.
//!
//! ## Trust modes
//! - `accept_self_signed`: any certificate is accepted (development relays)
//! - `pinned_thumbprint`: SHA-256 of the leaf certificate must match
//! - `system_trust`: platform root store via `rustls-native-certs`

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, CertificateError, ClientConfig as RustlsConfig, RootCertStore, ServerName};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};

use crate::config::{ClientConfig, TrustMode};
use crate::core::codec::{InboundLine, LineCodec};
use crate::error::{constants, ConnectError, ProtocolError, Result};
use crate::protocol::codec;
use crate::protocol::message::InboundEvent;
use crate::transport::Connector;
use crate::utils::timeout::{with_timeout_error, SHUTDOWN_TIMEOUT};

/// Accepts every server certificate.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Accepts only a leaf certificate whose SHA-256 matches the pin.
struct PinnedCertificate {
    fingerprint: Vec<u8>,
}

impl ServerCertVerifier for PinnedCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let presented = certificate_thumbprint(end_entity);
        if presented == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!(
                presented = %hex::encode(&presented),
                "{}",
                constants::ERR_PINNED_MISMATCH
            );
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }
}

/// SHA-256 of a DER certificate, the value `pinned_thumbprint` is compared against
pub fn certificate_thumbprint(cert: &Certificate) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(&cert.0);
    hasher.finalize().to_vec()
}

/// Build the rustls client configuration for a trust mode
pub fn tls_client_config(trust: &TrustMode) -> Result<RustlsConfig> {
    let builder = RustlsConfig::builder().with_safe_defaults();

    let config = match trust {
        TrustMode::AcceptSelfSigned => {
            warn!("Server certificate verification disabled (accept_self_signed)");
            builder
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth()
        }
        TrustMode::PinnedThumbprint(_) => {
            let fingerprint = trust
                .pinned_hash()
                .unwrap_or_else(|| Err(ProtocolError::Config("missing pin".into())))?;
            builder
                .with_custom_certificate_verifier(Arc::new(PinnedCertificate { fingerprint }))
                .with_no_client_auth()
        }
        TrustMode::SystemTrust => {
            let mut root_store = RootCertStore::empty();
            let native_certs = rustls_native_certs::load_native_certs().map_err(|e| {
                ProtocolError::Transport(format!("Failed to load native certs: {e}"))
            })?;

            let mut skipped = 0usize;
            for cert in native_certs {
                if root_store.add(&Certificate(cert.0)).is_err() {
                    skipped += 1;
                }
            }
            debug!(roots = root_store.len(), skipped, "Loaded platform trust roots");

            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
    };
    Ok(config)
}

/// Read half of a line connection.
pub struct LineReader<S> {
    frames: FramedRead<ReadHalf<S>, LineCodec>,
    read_timeout: Duration,
}

impl<S: AsyncRead> LineReader<S> {
    /// Next line. `ConnectionClosed` on EOF, `Timeout` after `read_timeout` of silence.
    pub async fn read_line(&mut self) -> Result<InboundLine> {
        match tokio::time::timeout(self.read_timeout, self.frames.next()).await {
            Err(_) => Err(ProtocolError::Timeout),
            Ok(None) => Err(ProtocolError::ConnectionClosed),
            Ok(Some(line)) => line,
        }
    }
}

/// Write half of a line connection.
pub struct LineWriter<S> {
    frames: FramedWrite<WriteHalf<S>, LineCodec>,
    write_timeout: Duration,
    closed: bool,
}

impl<S: AsyncWrite> LineWriter<S> {
    /// Write one line; the terminator is appended.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        with_timeout_error(self.frames.send(line), self.write_timeout).await
    }

    /// Flush and shut down the write side. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let shutdown = SinkExt::<&str>::close(&mut self.frames);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(Ok(())) => debug!("Command channel closed"),
            Ok(Err(e)) => debug!(error = %e, "Error while closing command channel"),
            Err(_) => debug!("Timed out closing command channel"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A framed, timed line connection over any duplex stream.
pub struct LineConnection<S> {
    reader: LineReader<S>,
    writer: LineWriter<S>,
}

impl<S: AsyncRead + AsyncWrite> LineConnection<S> {
    pub fn new(stream: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: LineReader {
                frames: FramedRead::new(read_half, LineCodec::new()),
                read_timeout,
            },
            writer: LineWriter {
                frames: FramedWrite::new(write_half, LineCodec::new()),
                write_timeout,
                closed: false,
            },
        }
    }

    pub async fn read_line(&mut self) -> Result<InboundLine> {
        self.reader.read_line().await
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_line(line).await
    }

    pub async fn close(&mut self) {
        self.writer.close().await
    }

    /// Read the welcome line and return the session id it assigns
    pub async fn read_welcome(&mut self) -> std::result::Result<String, ConnectError> {
        let line = match self.reader.read_line().await {
            Ok(InboundLine::Text(line)) => line,
            Ok(InboundLine::Oversized(len)) => {
                return Err(ConnectError::ProtocolViolation(format!(
                    "{}: {len} byte line",
                    constants::ERR_WELCOME_MALFORMED
                )))
            }
            Err(ProtocolError::Timeout) => return Err(ConnectError::Timeout),
            Err(ProtocolError::ConnectionClosed) => {
                return Err(ConnectError::ProtocolViolation(
                    constants::ERR_WELCOME_MISSING.into(),
                ))
            }
            Err(ProtocolError::Io(e)) => return Err(ConnectError::from(e)),
            Err(other) => return Err(ConnectError::Io(other.to_string())),
        };
        parse_welcome(&line)
    }

    pub fn into_split(self) -> (LineReader<S>, LineWriter<S>) {
        (self.reader, self.writer)
    }
}

/// Extract the session id from a welcome line
pub fn parse_welcome(line: &str) -> std::result::Result<String, ConnectError> {
    match codec::decode_line(line) {
        InboundEvent::Connected { session_id } if !session_id.is_empty() => Ok(session_id),
        _ => Err(ConnectError::ProtocolViolation(format!(
            "{}: {:.64}",
            constants::ERR_WELCOME_MALFORMED,
            line
        ))),
    }
}

/// An open command channel with its assigned session id
pub struct RawConnection<S = ClientTlsStream<TcpStream>> {
    pub session_id: String,
    pub connection: LineConnection<S>,
}

fn map_handshake_error(e: io::Error) -> ConnectError {
    if let Some(tls_error) = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return match tls_error {
            rustls::Error::InvalidCertificate(reason) => {
                ConnectError::CertificateRejected(format!("{reason:?}"))
            }
            other => ConnectError::ProtocolViolation(format!("TLS handshake failed: {other}")),
        };
    }
    ConnectError::from(e)
}

/// Open the command channel: TCP, TLS, welcome.
#[instrument(skip(config), fields(addr = %config.command_addr(), server_name = %config.server_name))]
pub async fn open(config: &ClientConfig) -> std::result::Result<RawConnection, ConnectError> {
    let tls_config = tls_client_config(&config.trust_mode)
        .map_err(|e| ConnectError::CertificateRejected(e.to_string()))?;
    let server_name = ServerName::try_from(config.server_name.as_str()).map_err(|_| {
        ConnectError::ProtocolViolation(format!("Invalid server name '{}'", config.server_name))
    })?;
    let connector = TlsConnector::from(Arc::new(tls_config));

    let attempt = async {
        let stream = TcpStream::connect(config.command_addr()).await?;
        stream.set_nodelay(true)?;

        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(map_handshake_error)?;

        let mut connection = LineConnection::new(tls, config.read_timeout, config.write_timeout);
        let session_id = connection.read_welcome().await?;
        Ok::<_, ConnectError>(RawConnection {
            session_id,
            connection,
        })
    };

    let raw = tokio::time::timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| ConnectError::Timeout)??;

    info!(session_id = %raw.session_id, "Command channel open");
    Ok(raw)
}

/// [`Connector`] for the real relay: TCP + TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsTransport;

impl Connector for TlsTransport {
    type Stream = ClientTlsStream<TcpStream>;

    fn open(
        &self,
        config: ClientConfig,
    ) -> BoxFuture<'static, std::result::Result<RawConnection<Self::Stream>, ConnectError>> {
        Box::pin(async move { open(&config).await })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (LineConnection<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        (
            LineConnection::new(client, Duration::from_secs(5), Duration::from_secs(5)),
            server,
        )
    }

    #[tokio::test]
    async fn test_welcome_is_parsed() {
        let (mut conn, mut server) = pair();
        server.write_all(b"CONNECTED|abc123\n").await.unwrap();
        assert_eq!(conn.read_welcome().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn test_wrong_first_line_is_a_violation() {
        let (mut conn, mut server) = pair();
        server.write_all(b"PONG\n").await.unwrap();
        assert!(matches!(
            conn.read_welcome().await,
            Err(ConnectError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_before_welcome() {
        let (mut conn, server) = pair();
        drop(server);
        assert_eq!(
            conn.read_welcome().await,
            Err(ConnectError::ProtocolViolation(
                constants::ERR_WELCOME_MISSING.into()
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (mut conn, _server) = pair();
        assert!(matches!(conn.read_line().await, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _server) = pair();
        let (_reader, mut writer) = conn.into_split();
        writer.close().await;
        writer.close().await;
        assert!(writer.is_closed());
        assert!(matches!(
            writer.write_line("PING").await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_flushes_and_shuts_down() {
        let (conn, mut server) = pair();
        let (_reader, mut writer) = conn.into_split();
        writer.write_line("BYE").await.unwrap();
        writer.close().await;

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"BYE\n");
    }

    #[test]
    fn test_pinned_verifier() {
        let cert = Certificate(vec![1, 2, 3, 4]);
        let verifier = PinnedCertificate {
            fingerprint: certificate_thumbprint(&cert),
        };
        let name = ServerName::try_from("localhost").unwrap();
        let now = std::time::SystemTime::now();

        assert!(verifier
            .verify_server_cert(&cert, &[], &name, &mut std::iter::empty(), &[], now)
            .is_ok());
        let other = Certificate(vec![9, 9, 9]);
        assert!(matches!(
            verifier.verify_server_cert(&other, &[], &name, &mut std::iter::empty(), &[], now),
            Err(rustls::Error::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_bad_pin_is_a_config_error() {
        let trust = TrustMode::PinnedThumbprint("not-hex".into());
        assert!(tls_client_config(&trust).is_err());
        assert!(tls_client_config(&TrustMode::AcceptSelfSigned).is_ok());
    }

    #[tokio::test]
    async fn test_refused_port_maps_to_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig {
            host: "127.0.0.1".into(),
            command_port: port,
            ..ClientConfig::default()
        };
        assert!(matches!(open(&config).await, Err(ConnectError::Refused)));
    }
}
