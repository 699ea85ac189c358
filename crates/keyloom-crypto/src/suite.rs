//! Algorithm suite versions

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Algorithm suite used by a provision.
///
/// The suite fixes the self-ratchet derivation and the AEAD. It is persisted
/// as a raw byte so an unknown value read back from storage surfaces as
/// [`CryptoError::UnsupportedSuite`] instead of a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SuiteVersion {
    /// HKDF-SHA256 self-ratchet, XChaCha20-Poly1305, X25519
    #[default]
    V1,
}

impl SuiteVersion {
    /// Wire value of this suite.
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
        }
    }
}

impl TryFrom<u8> for SuiteVersion {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            other => Err(CryptoError::UnsupportedSuite(other)),
        }
    }
}

impl From<SuiteVersion> for u8 {
    fn from(suite: SuiteVersion) -> Self {
        suite.as_u8()
    }
}
