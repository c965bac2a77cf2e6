//! # Datagram Channel
//!
//! Encrypted, length-prefixed JSON over UDP for position and input updates.
//!
//! Outbound, an authenticated session with encryption frames every payload as
//! `[u32 LE length][AES-256-CBC(JSON)]`. Without a cipher the raw JSON is sent.
//!
//! Inbound, decoding tries the encrypted path first and falls back to parsing the whole
//! buffer as plaintext JSON, so peers that never enabled encryption keep working.
//! Anything that fails both is dropped and counted; nothing propagates to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::UdpSocket;
use tracing::{debug, instrument, trace};

use crate::config::MAX_DATAGRAM_SIZE;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::utils::crypto::SessionCipher;

/// How an inbound datagram was decoded
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// Length prefix valid and ciphertext decrypted to JSON
    Decrypted(Value),
    /// Accepted as raw JSON after the encrypted path failed
    Plaintext(Value),
    /// Neither path produced JSON
    Dropped,
}

impl DecodeOutcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            DecodeOutcome::Decrypted(v) | DecodeOutcome::Plaintext(v) => Some(v),
            DecodeOutcome::Dropped => None,
        }
    }
}

/// Running totals for one codec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatagramStats {
    pub decrypted: u64,
    pub plaintext_fallbacks: u64,
    pub decrypt_failures: u64,
    pub dropped: u64,
}

/// Datagram framing plus optional session cipher.
#[derive(Debug, Clone)]
pub struct DatagramCodec {
    cipher: Option<SessionCipher>,
    max_packet_size: usize,
    stats: DatagramStats,
}

impl DatagramCodec {
    pub fn new(cipher: Option<SessionCipher>) -> Self {
        Self::with_max_packet_size(cipher, MAX_DATAGRAM_SIZE)
    }

    pub fn with_max_packet_size(cipher: Option<SessionCipher>, max_packet_size: usize) -> Self {
        Self {
            cipher,
            max_packet_size,
            stats: DatagramStats::default(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn stats(&self) -> DatagramStats {
        self.stats
    }

    /// Serialize, encrypt (when keyed) and frame one payload.
    pub fn encode(&self, payload: &Value) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(payload)?;
        let bytes = match &self.cipher {
            Some(cipher) => Packet::new(cipher.encrypt(&json)).to_bytes(),
            None => json,
        };

        if bytes.len() > self.max_packet_size {
            return Err(ProtocolError::Transport(format!(
                "Datagram of {} bytes exceeds limit of {}",
                bytes.len(),
                self.max_packet_size
            )));
        }
        Ok(bytes)
    }

    /// Decode one received buffer, reporting which path succeeded.
    pub fn decode_detailed(&mut self, bytes: &[u8]) -> DecodeOutcome {
        if let Some(cipher) = &self.cipher {
            match Packet::from_bytes(bytes).and_then(|p| cipher.decrypt(&p.payload)) {
                Ok(plain) => match serde_json::from_slice::<Value>(&plain) {
                    Ok(value) => {
                        self.stats.decrypted += 1;
                        return DecodeOutcome::Decrypted(value);
                    }
                    Err(e) => {
                        self.stats.decrypt_failures += 1;
                        trace!(error = %e, "Decrypted datagram is not JSON");
                    }
                },
                Err(e) => {
                    self.stats.decrypt_failures += 1;
                    trace!(error = %e, len = bytes.len(), "Encrypted datagram path failed");
                }
            }
        }

        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) if value.is_object() => {
                self.stats.plaintext_fallbacks += 1;
                DecodeOutcome::Plaintext(value)
            }
            _ => {
                self.stats.dropped += 1;
                debug!(len = bytes.len(), "Dropping undecodable datagram");
                DecodeOutcome::Dropped
            }
        }
    }

    /// Decode one received buffer; `None` means dropped.
    pub fn decode(&mut self, bytes: &[u8]) -> Option<Value> {
        self.decode_detailed(bytes).into_value()
    }
}

/// Connected UDP socket for one session.
#[derive(Debug, Clone)]
pub struct DatagramChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    max_packet_size: usize,
}

impl DatagramChannel {
    /// Bind an ephemeral local port and connect it to the relay's datagram port
    #[instrument(fields(addr = %addr))]
    pub async fn open(addr: &str, max_packet_size: usize) -> Result<Self> {
        let peer = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| ProtocolError::Transport(format!("Cannot resolve {addr}")))?;

        let bind: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        debug!(local = ?socket.local_addr().ok(), %peer, "Datagram channel open");

        Ok(Self {
            socket: Arc::new(socket),
            peer,
            max_packet_size,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.socket.send(bytes).await?;
        Ok(())
    }

    /// Receive one datagram. Oversized datagrams are truncated by the OS.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.max_packet_size];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}
