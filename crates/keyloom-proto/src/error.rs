//! Protocol encoding errors

use thiserror::Error;

/// Result alias for protocol encoding operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from encoding or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CBOR serialization failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),

    /// Encoded value exceeds the size limit
    #[error("encoded value too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Message kind is not part of the protocol's catalog
    #[error("unknown message kind {kind} for protocol {protocol}")]
    UnknownMessageKind {
        /// Protocol the message claims to belong to
        protocol: u16,
        /// Raw message kind
        kind: u16,
    },
}
