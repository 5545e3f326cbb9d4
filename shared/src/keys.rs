//! Account key generation, portable key documents and secure storage

use crate::error::{CryptoError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{
    password_hash::{rand_core::OsRng as ArgonRng, SaltString},
    Argon2, PasswordHasher,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key type written to exported key documents
pub const KEY_TYPE: &str = "OKP";

/// The only curve accepted by [`import_public`] and [`import_private`]
pub const CURVE: &str = "X25519";

const KEY_LEN: usize = 32;

/// Account key pair used for session key agreement
///
/// One pair exists per account per device. The secret half never leaves the
/// device; only [`export_public`] output is published on the profile record.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccountKeyPair {
    secret: StaticSecret,
    #[zeroize(skip)]
    public: PublicKey,
}

impl AccountKeyPair {
    /// Get the public half
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl std::fmt::Debug for AccountKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKeyPair")
            .field("public", &fingerprint(&self.public))
            .finish_non_exhaustive()
    }
}

/// JSON key document, modelled on an OKP JSON Web Key
#[derive(Serialize, Deserialize)]
struct KeyDocument {
    kty: String,
    crv: String,
    x: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    d: Option<String>,
}

/// Generate a new account key pair
///
/// Uses cryptographically secure random number generation from the OS.
pub fn generate_key_pair() -> AccountKeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    AccountKeyPair { secret, public }
}

/// Export a public key as a portable key document
pub fn export_public(key: &PublicKey) -> String {
    let doc = KeyDocument {
        kty: KEY_TYPE.to_string(),
        crv: CURVE.to_string(),
        x: URL_SAFE_NO_PAD.encode(key.as_bytes()),
        d: None,
    };
    // A struct of plain strings always serializes
    serde_json::to_string(&doc).unwrap_or_default()
}

/// Export a full key pair, including the secret half
///
/// Only meant for moving key material between local storage layers; the
/// result must never be sent over the network.
pub fn export_private(pair: &AccountKeyPair) -> String {
    let mut secret = pair.secret.to_bytes();
    let doc = KeyDocument {
        kty: KEY_TYPE.to_string(),
        crv: CURVE.to_string(),
        x: URL_SAFE_NO_PAD.encode(pair.public.as_bytes()),
        d: Some(URL_SAFE_NO_PAD.encode(secret)),
    };
    secret.zeroize();
    serde_json::to_string(&doc).unwrap_or_default()
}

/// Import a peer's public key from a key document
///
/// Fails on malformed JSON, an unsupported key type or curve, bad encoding,
/// a wrong length, or the all-zero point. Callers treat failure as "peer has
/// no usable key".
pub fn import_public(document: &str) -> Result<PublicKey> {
    let doc = parse_document(document)?;
    let bytes = decode_component(&doc.x, "x")?;
    if bytes == [0u8; KEY_LEN] {
        return Err(CryptoError::InvalidKey("public key is the zero point".into()));
    }
    Ok(PublicKey::from(bytes))
}

/// Import a key pair from a document produced by [`export_private`]
pub fn import_private(document: &str) -> Result<AccountKeyPair> {
    let mut doc = parse_document(document)?;
    let d = doc
        .d
        .take()
        .ok_or(CryptoError::MissingKey("private component \"d\""))?;
    let mut secret = decode_component(&d, "d")?;
    let pair = AccountKeyPair::from_secret_bytes(secret);
    secret.zeroize();

    let claimed = decode_component(&doc.x, "x")?;
    if !crate::constant_time_eq(&claimed, pair.public.as_bytes()) {
        return Err(CryptoError::InvalidKey(
            "public component does not match private key".into(),
        ));
    }
    Ok(pair)
}

fn parse_document(document: &str) -> Result<KeyDocument> {
    let doc: KeyDocument = serde_json::from_str(document)
        .map_err(|e| CryptoError::InvalidKey(format!("malformed key document: {}", e)))?;
    if doc.kty != KEY_TYPE {
        return Err(CryptoError::UnsupportedCurve(format!("key type {}", doc.kty)));
    }
    if doc.crv != CURVE {
        return Err(CryptoError::UnsupportedCurve(doc.crv));
    }
    Ok(doc)
}

fn decode_component(value: &str, name: &str) -> Result<[u8; KEY_LEN]> {
    let raw = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|_| CryptoError::InvalidKey(format!("component {} is not base64url", name)))?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        CryptoError::InvalidKey(format!(
            "component {} has length {}, expected {}",
            name,
            raw.len(),
            KEY_LEN
        ))
    })
}

/// Short SHA-256 fingerprint of a public key, for logs and manual comparison
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

/// Securely store a key pair encrypted with a password
///
/// Uses Argon2id for key derivation and AES-256-GCM for encryption.
/// Format: `[salt (22 bytes)] [nonce (12 bytes)] [ciphertext]`.
pub fn secure_store(pair: &AccountKeyPair, password: &str) -> Result<Vec<u8>> {
    let mut plaintext = pair.secret.to_bytes();

    let salt = SaltString::generate(&mut ArgonRng);
    let cipher = password_cipher(password, &salt)?;

    let nonce_bytes = rand::random::<[u8; 12]>();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|e| CryptoError::EncryptionError(e.to_string()));
    plaintext.zeroize();
    let ciphertext = ciphertext?;

    let mut result = Vec::with_capacity(22 + 12 + ciphertext.len());
    result.extend_from_slice(salt.as_str().as_bytes());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Load a key pair from encrypted storage
pub fn secure_load(encrypted: &[u8], password: &str) -> Result<AccountKeyPair> {
    if encrypted.len() < 34 {
        return Err(CryptoError::InvalidKey("Encrypted data too short".to_string()));
    }

    let salt_str = std::str::from_utf8(&encrypted[..22])
        .map_err(|_| CryptoError::InvalidKey("Invalid salt encoding".to_string()))?;
    let salt = SaltString::from_b64(salt_str)
        .map_err(|_| CryptoError::InvalidKey("Invalid salt format".to_string()))?;

    let nonce = Nonce::from_slice(&encrypted[22..34]);
    let cipher = password_cipher(password, &salt)?;

    let mut plaintext = cipher.decrypt(nonce, &encrypted[34..]).map_err(|_| {
        CryptoError::EncryptionError("Decryption failed - wrong password?".to_string())
    })?;

    let secret: Result<[u8; KEY_LEN]> = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("Decrypted key has wrong length".to_string()));
    plaintext.zeroize();
    let mut secret = secret?;

    let pair = AccountKeyPair::from_secret_bytes(secret);
    secret.zeroize();
    Ok(pair)
}

fn password_cipher(password: &str, salt: &SaltString) -> Result<Aes256Gcm> {
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), salt)
        .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;
    let key_material = password_hash
        .hash
        .ok_or_else(|| CryptoError::KeyDerivationError("No hash generated".to_string()))?;
    let bytes = key_material.as_bytes();
    if bytes.len() < 32 {
        return Err(CryptoError::KeyDerivationError("hash output too short".into()));
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes[..32])))
}
