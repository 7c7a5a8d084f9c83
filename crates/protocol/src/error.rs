//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed (bad hex, wrong key length or padding).
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Hex text could not be decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Invalid or malformed Diffie-Hellman public value.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Message errors
    /// A required field was absent from a message's data.
    #[error("missing field `{field}` in {event} message")]
    MissingField {
        /// Event name of the offending message.
        event: String,
        /// The missing data key.
        field: String,
    },

    /// A field was present but could not be interpreted.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField {
        /// The offending data key.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    // Connection errors
    /// Connection was closed or is not established.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending a frame over an established connection failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<hex::FromHexError> for ProtocolError {
    fn from(err: hex::FromHexError) -> Self {
        ProtocolError::Encoding(err.to_string())
    }
}
