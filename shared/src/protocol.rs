//! Real-time wire protocol
//!
//! Frames are MessagePack maps with named fields, sent as binary WebSocket
//! messages. Every frame carries a `type` tag. Ids and timestamps use their
//! human-readable (string) forms so tagged enums decode them unambiguously.

use crate::error::ProtocolError;
use crate::model::{AccountId, MessageEnvelope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typing indicator payload, forwarded verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    /// Thread the indicator belongs to
    pub thread_id: Uuid,
    /// Who is typing
    pub sender_id: AccountId,
    /// Who should see it
    pub receiver_id: AccountId,
}

/// Events sent by a client to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Announce the account behind this connection
    Identify {
        /// Claimed account
        account_id: AccountId,
        /// Bearer credential from the auth service
        #[serde(default)]
        token: Option<String>,
    },
    /// Push a message to the receiver's live connections
    SendMessage {
        /// The message
        envelope: MessageEnvelope,
    },
    /// Sender started typing
    Typing(TypingNotice),
    /// Sender stopped typing
    StopTyping(TypingNotice),
    /// Application-level keepalive
    Ping,
}

/// Events sent by the gateway to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Identification accepted
    Identified {
        /// The account bound to this connection
        account_id: AccountId,
        /// Server-side handle of this connection
        connection_id: Uuid,
    },
    /// Everyone currently online
    PresenceSnapshot {
        /// Online accounts, sorted
        online: Vec<AccountId>,
    },
    /// A message pushed live by its sender
    MessageReceived {
        /// The message
        envelope: MessageEnvelope,
    },
    /// Counterparty started typing
    Typing(TypingNotice),
    /// Counterparty stopped typing
    StopTyping(TypingNotice),
    /// Reply to [`ClientEvent::Ping`]
    Pong,
    /// Request failed
    Error {
        /// HTTP-style status code
        code: u16,
        /// Client-safe description
        message: String,
    },
}

/// Encode a frame
pub fn encode<T: Serialize>(event: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = Vec::with_capacity(128);
    let mut serializer = rmp_serde::Serializer::new(&mut frame)
        .with_struct_map()
        .with_human_readable();
    event.serialize(&mut serializer)?;
    Ok(frame)
}

/// Decode a frame
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    let mut deserializer = rmp_serde::Deserializer::from_read_ref(frame).with_human_readable();
    Ok(T::deserialize(&mut deserializer)?)
}
