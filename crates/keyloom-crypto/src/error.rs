//! Error types for cryptographic primitives

use thiserror::Error;

/// Errors from the cryptographic primitive service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key length does not match the algorithm's fixed key size
    #[error("incorrect key size: expected {expected} bytes, got {actual}")]
    IncorrectKeySize {
        /// Required key length
        expected: usize,
        /// Provided key length
        actual: usize,
    },

    /// Ciphertext is shorter than nonce plus tag
    #[error("incorrect block size: need at least {minimum} bytes, got {actual}")]
    IncorrectBlockSize {
        /// Minimum acceptable length
        minimum: usize,
        /// Provided length
        actual: usize,
    },

    /// AEAD authentication failed (wrong key or tampered ciphertext)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Why decryption failed
        reason: String,
    },

    /// Suite version is not known to this build
    #[error("unsupported suite version: {0}")]
    UnsupportedSuite(u8),

    /// Peer supplied a public key that yields a non-contributory agreement
    #[error("invalid public key: agreement is not contributory")]
    InvalidPublicKey,
}

impl CryptoError {
    /// Returns true if this error indicates a build or catalog defect rather
    /// than bad input from a peer.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::UnsupportedSuite(_))
    }
}
