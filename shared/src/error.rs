//! Error types for cryptographic, storage and codec operations

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Key document names a curve or key type we cannot use
    #[error("Unsupported curve: {0}")]
    UnsupportedCurve(String),

    /// A key that is required for the operation is absent
    #[error("Missing key: {0}")]
    MissingKey(&'static str),

    /// Encryption/decryption failure
    #[error("Encryption error: {0}")]
    EncryptionError(String),

    /// Key derivation failure
    #[error("Key derivation failed: {0}")]
    KeyDerivationError(String),
}

/// Result type alias for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors returned by conversation and profile repositories
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced thread, message or account does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was rejected by validation
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// The caller may not access the resource
    #[error("Unauthorized")]
    Unauthorized,

    /// The backing store failed
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type alias for repository operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors from the real-time wire codec
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
