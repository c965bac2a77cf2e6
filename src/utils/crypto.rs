//! # Datagram Session Cipher
//!
//! AES-256-CBC with PKCS#7 padding, keyed per session.
//!
//! ## Key derivation
//! ```text
//! digest = SHA256(session_id || shared_secret)
//! key    = digest[0..32]
//! iv     = digest[0..16]
//! ```
//! Both peers derive the same material from the session id the server assigned in the
//! welcome line, so nothing secret crosses the wire. The IV is fixed for the lifetime of
//! the session; this matches what the relay expects.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{constants, ProtocolError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256-CBC key + IV pair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionCipher {
    key: [u8; 32],
    iv: [u8; 16],
}

impl SessionCipher {
    /// Build a cipher from raw key material
    pub fn new(key: [u8; 32], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Derive the per-session key and IV (see module docs for the scheme)
    pub fn derive(session_id: &str, shared_secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update(shared_secret.as_bytes());
        let mut digest: [u8; 32] = hasher.finalize().into();

        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[..16]);
        let cipher = Self { key: digest, iv };

        digest.zeroize();
        cipher
    }

    /// Encrypt with PKCS#7 padding. Never fails: padding always fits a fresh buffer.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Decrypt and strip PKCS#7 padding.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(ProtocolError::Crypto(constants::ERR_DECRYPTION_FAILED.into()));
        }

        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| ProtocolError::Crypto(constants::ERR_DECRYPTION_FAILED.into()))
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}

/// Crypto state for the datagram channel of one authenticated session.
///
/// Only the session state machine creates one, on successful authentication when the
/// server advertised `udpEncryption`. Dropping it (disconnect) wipes the key.
#[derive(Clone, Debug)]
pub struct CryptoContext {
    session_id: String,
    cipher: SessionCipher,
}

impl CryptoContext {
    pub fn derive(session_id: &str, shared_secret: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            cipher: SessionCipher::derive(session_id, shared_secret),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }
}
