//! Error types for the Keyloom engine.
//!
//! One enum per layer: the key ledger, channels, and the engine facade.
//! Protocol catalog and step errors live in [`crate::protocol`], storage
//! errors in [`crate::storage`].

use keyloom_crypto::{CryptoError, KeyId};
use keyloom_proto::{DeviceUid, IdentityId, ProtocolError};
use thiserror::Error;

use crate::{
    channel::ChannelId,
    protocol::{CatalogError, StepError},
    storage::StorageError,
};

/// Errors from provision and key material bookkeeping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Referenced epoch has no provision
    #[error("no provision for full ratchet count {full_ratchet_count}")]
    ProvisionNotFound {
        /// Epoch that was looked up
        full_ratchet_count: u64,
    },

    /// Stored suite is unknown to this build
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Underlying storage failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from channel encryption, decryption and rekeying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No held key material matches the unit's key id
    ///
    /// The key may not be provisioned yet, or the unit is stale, replayed or
    /// corrupt.
    #[error("no matching key for {key_id:?}")]
    NoMatchingKey {
        /// Key id carried by the unit
        key_id: KeyId,
    },

    /// Channel does not exist
    #[error("unknown channel {0:?}")]
    UnknownChannel(ChannelId),

    /// Active epoch of the channel has no provision
    #[error("channel has no active provision (epoch {full_ratchet_count})")]
    NoActiveProvision {
        /// Epoch marked active on the channel
        full_ratchet_count: u64,
    },

    /// Full ratchet would replace an existing epoch
    #[error("epoch {full_ratchet_count} is not newer than latest epoch {latest}")]
    StaleEpoch {
        /// Epoch that was requested
        full_ratchet_count: u64,
        /// Newest epoch the channel holds
        latest: u64,
    },

    /// Ledger bookkeeping failed
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// AEAD failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Underlying storage failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ChannelError {
    /// Returns true if this error may succeed on retry.
    ///
    /// A missing key may show up once the provision self-ratchets further.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoMatchingKey { .. } => true,
            Self::Storage(err) | Self::Ledger(LedgerError::Storage(err)) => err.is_transient(),
            Self::UnknownChannel(_)
            | Self::NoActiveProvision { .. }
            | Self::StaleEpoch { .. }
            | Self::Ledger(LedgerError::ProvisionNotFound { .. } | LedgerError::Crypto(_))
            | Self::Crypto(_) => false,
        }
    }
}

/// Errors surfaced by the engine facade.
///
/// Stale and undecodable protocol messages are not errors; they come back as
/// discarded dispatch outcomes.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Message or request names an identity this engine does not own
    #[error("unknown owned identity {0}")]
    UnknownIdentity(IdentityId),

    /// Envelope is for another device of an owned identity
    #[error("envelope addressed to device {device}, not this one")]
    MisroutedEnvelope {
        /// Device the envelope names
        device: DeviceUid,
    },

    /// Protocol catalog defect
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Channel failure
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Collaborator failure inside a protocol step
    #[error("step failed: {0}")]
    Step(#[from] StepError),

    /// Crypto failure outside a channel (sealed boxes)
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Envelope or message encoding failure
    #[error("encoding error: {0}")]
    Encoding(#[from] ProtocolError),

    /// Underlying storage failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Returns true if the failed call may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Channel(err) => err.is_transient(),
            Self::Storage(err) => err.is_transient(),
            Self::Step(err) => err.is_transient(),
            Self::UnknownIdentity(_)
            | Self::MisroutedEnvelope { .. }
            | Self::Catalog(_)
            | Self::Crypto(_)
            | Self::Encoding(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_transient() {
        let err = ChannelError::NoMatchingKey { key_id: KeyId::from_bytes([0; 32]) };
        assert!(err.is_transient());
        assert!(EngineError::Channel(err).is_transient());
    }

    #[test]
    fn io_is_transient_through_every_layer() {
        let io = StorageError::Io("disk".to_string());
        assert!(ChannelError::Ledger(LedgerError::Storage(io.clone())).is_transient());
        assert!(EngineError::Storage(io).is_transient());
    }

    #[test]
    fn crypto_and_config_errors_are_fatal() {
        assert!(!ChannelError::Crypto(CryptoError::UnsupportedSuite(9)).is_transient());
        assert!(
            !ChannelError::Ledger(LedgerError::ProvisionNotFound { full_ratchet_count: 1 })
                .is_transient()
        );
        assert!(!EngineError::UnknownIdentity(IdentityId::from_bytes([1; 32])).is_transient());
    }
}
