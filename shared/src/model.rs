//! Accounts, threads and message envelopes

use crate::cipher::CipherEnvelope;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum accepted length of an account id, in bytes
pub const MAX_ACCOUNT_ID_LEN: usize = 128;

/// Opaque account identity issued by the external auth service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    /// Validate and wrap an account id
    pub fn new(id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(StoreError::Invalid("account id is empty".into()));
        }
        if id.len() > MAX_ACCOUNT_ID_LEN {
            return Err(StoreError::Invalid("account id is too long".into()));
        }
        if id.chars().any(char::is_control) {
            return Err(StoreError::Invalid("account id contains control characters".into()));
        }
        Ok(Self(id))
    }

    /// Borrow as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl TryFrom<String> for AccountId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AccountId::new(value)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A two-member conversation
///
/// Members are kept in sorted order so the pair is canonical; there is at
/// most one thread per unordered pair of accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Thread id
    pub id: Uuid,
    /// The two members, sorted
    pub members: [AccountId; 2],
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Thread {
    /// Sort a pair of accounts into canonical member order
    ///
    /// Rejects a thread with oneself.
    pub fn canonical_pair(a: &AccountId, b: &AccountId) -> Result<[AccountId; 2], StoreError> {
        if a == b {
            return Err(StoreError::Invalid("cannot open a thread with yourself".into()));
        }
        if a < b {
            Ok([a.clone(), b.clone()])
        } else {
            Ok([b.clone(), a.clone()])
        }
    }

    /// Whether `account` belongs to this thread
    pub fn has_member(&self, account: &AccountId) -> bool {
        self.members.iter().any(|m| m == account)
    }

    /// The member that is not `me`, if `me` is a member
    pub fn counterparty(&self, me: &AccountId) -> Option<&AccountId> {
        match &self.members {
            [a, b] if a == me => Some(b),
            [a, b] if b == me => Some(a),
            _ => None,
        }
    }
}

/// Message body as stored and transmitted
///
/// The variant is decided when the message is written, so readers never
/// have to guess whether a body is ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Unencrypted text, used when no session key is available
    Plaintext {
        /// The text
        text: String,
    },
    /// Sealed body
    Encrypted {
        /// The ciphertext envelope
        envelope: CipherEnvelope,
    },
}

impl MessageContent {
    /// Whether this body is ciphertext
    pub fn is_encrypted(&self) -> bool {
        matches!(self, MessageContent::Encrypted { .. })
    }

    /// Serialize for a storage column
    pub fn to_storage(&self) -> String {
        // Enum of strings and byte vectors always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Read a storage column
    ///
    /// Rows written before bodies were tagged hold either a bare envelope or
    /// raw text. Those are recognised structurally, falling back to raw text.
    pub fn from_storage(raw: &str) -> Self {
        if let Ok(content) = serde_json::from_str::<MessageContent>(raw) {
            return content;
        }
        match CipherEnvelope::from_json(raw) {
            Some(envelope) => MessageContent::Encrypted { envelope },
            None => MessageContent::Plaintext {
                text: raw.to_string(),
            },
        }
    }
}

/// The unit exchanged over the gateway and stored by the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Message id, chosen by the sender so live and stored copies match
    pub id: Uuid,
    /// Owning thread
    pub thread_id: Uuid,
    /// Author
    pub sender_id: AccountId,
    /// The other member of the thread
    pub receiver_id: AccountId,
    /// Body
    pub content: MessageContent,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Build a new outgoing message with a fresh id
    pub fn compose(
        thread_id: Uuid,
        sender_id: AccountId,
        receiver_id: AccountId,
        content: MessageContent,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            sender_id,
            receiver_id,
            content,
            created_at: Utc::now(),
        }
    }
}

/// Serde adapter storing byte vectors as standard base64 strings
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as base64
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize bytes from base64
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
