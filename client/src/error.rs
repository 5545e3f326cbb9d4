//! Client error types

use parley_shared::{CryptoError, StoreError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no conversation is open")]
    NoActiveThread,

    #[error("account is not a member of this thread")]
    NotAMember,

    #[error("message is empty")]
    EmptyMessage,

    #[error("no pending message {0}")]
    UnknownMessage(Uuid),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
