//! Codec error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding a sync payload
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Authentication failed: payload was tampered with or the password is wrong")]
    AuthenticationFailed,

    #[error("Payload is encrypted but no encryption password is configured")]
    PasswordRequired,

    #[error("Invalid encrypted payload: {0}")]
    InvalidFormat(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Compression error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for codec operations
pub type CodecResult<T> = Result<T, CodecError>;
