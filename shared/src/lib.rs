//! Parley shared primitives
//!
//! This crate provides the pieces both ends of Parley agree on: account key
//! pairs and their portable documents, session key agreement, the message
//! cipher, the thread/message data model, the real-time wire protocol and the
//! repository interfaces.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod cipher;
pub mod error;
pub mod keys;
pub mod model;
pub mod protocol;
pub mod session;
pub mod store;

pub use cipher::{
    decrypt, encrypt, looks_encrypted, CipherEnvelope, Decrypted, UNDECRYPTABLE_PLACEHOLDER,
};
pub use error::{CryptoError, ProtocolError, StoreError, StoreResult};
pub use keys::{
    export_private, export_public, fingerprint, generate_key_pair, import_private,
    import_public, secure_load, secure_store, AccountKeyPair,
};
pub use model::{AccountId, MessageContent, MessageEnvelope, Thread};
pub use protocol::{ClientEvent, ServerEvent, TypingNotice};
pub use session::{derive_session_key, SessionKey};
pub use store::{ConversationRepository, InMemoryStore, ProfileDirectory};

/// Re-exported so callers can name the public key type without another dependency
pub use x25519_dalek::PublicKey;

use subtle::ConstantTimeEq;

/// Version of the wire protocol
pub const PROTOCOL_VERSION: u8 = 1;

/// Constant-time comparison of byte arrays
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
