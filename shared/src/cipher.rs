//! Message body encryption
//!
//! Bodies are sealed with AES-256-GCM under a [`SessionKey`]. Each call to
//! [`encrypt`] draws a fresh 96-bit nonce from the OS RNG; nonces are never
//! cached or counted.

use crate::error::{CryptoError, Result};
use crate::session::SessionKey;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Nonce length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Current envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// Text shown in place of a message that failed authentication
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "message could not be decrypted";

/// Self-describing ciphertext unit: `{version, nonce, ciphertext}`
///
/// Binary fields are base64 so the envelope survives JSON storage and the
/// MessagePack wire format unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherEnvelope {
    /// Format version
    pub version: u8,
    /// 96-bit nonce
    #[serde(with = "crate::model::base64_bytes")]
    pub nonce: Vec<u8>,
    /// Ciphertext with appended tag
    #[serde(with = "crate::model::base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl CipherEnvelope {
    /// Structural validity: known version, correct nonce length, room for a tag
    pub fn is_well_formed(&self) -> bool {
        self.version == ENVELOPE_VERSION
            && self.nonce.len() == NONCE_LEN
            && self.ciphertext.len() >= TAG_LEN
    }

    /// Parse an envelope from its JSON form
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str::<CipherEnvelope>(raw)
            .ok()
            .filter(CipherEnvelope::is_well_formed)
    }
}

/// Outcome of [`decrypt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decrypted {
    /// Authenticated plaintext
    Plaintext(String),
    /// Tag mismatch, malformed envelope or non-UTF-8 body
    Undecryptable,
}

impl Decrypted {
    /// Text to render for this outcome
    pub fn into_display(self) -> String {
        match self {
            Decrypted::Plaintext(text) => text,
            Decrypted::Undecryptable => UNDECRYPTABLE_PLACEHOLDER.to_string(),
        }
    }
}

/// Encrypt `plaintext` under `key`
pub fn encrypt(key: &SessionKey, plaintext: &str) -> Result<CipherEnvelope> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    Ok(CipherEnvelope {
        version: ENVELOPE_VERSION,
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    })
}

/// Decrypt an envelope, failing closed
pub fn decrypt(key: &SessionKey, envelope: &CipherEnvelope) -> Decrypted {
    if !envelope.is_well_formed() {
        return Decrypted::Undecryptable;
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&envelope.nonce);

    match cipher.decrypt(nonce, envelope.ciphertext.as_ref()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Decrypted::Plaintext(text),
            Err(_) => Decrypted::Undecryptable,
        },
        Err(_) => Decrypted::Undecryptable,
    }
}

/// Best-effort check whether a raw stored string is a ciphertext envelope
pub fn looks_encrypted(raw: &str) -> bool {
    CipherEnvelope::from_json(raw).is_some()
}
