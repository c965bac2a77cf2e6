use crate::error::{constants, ProtocolError, Result};

/// Size of the little-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// One datagram: `[u32 LE body length][body]`.
///
/// The body is opaque here; it is AES ciphertext for authenticated sessions and raw
/// JSON for legacy peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Serialize with the length prefix
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a received buffer. The declared length must equal `buf.len() - 4` exactly.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Err(ProtocolError::Crypto(constants::ERR_LENGTH_MISMATCH.into()));
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
        let declared = u32::from_le_bytes(prefix) as usize;

        if declared != buf.len() - LENGTH_PREFIX_SIZE {
            return Err(ProtocolError::Crypto(constants::ERR_LENGTH_MISMATCH.into()));
        }

        Ok(Self {
            payload: buf[LENGTH_PREFIX_SIZE..].to_vec(),
        })
    }
}
