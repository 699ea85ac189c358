//! Self-ratchet for forward-secure key emission
//!
//! # Security Properties
//!
//! - Forward Secrecy: each step consumes a seed and emits the next one
//!   through HKDF, so a captured seed reveals nothing about earlier keys
//! - Key Uniqueness: every step yields a fresh key and key identifier
//! - Determinism: the same seed and suite always produce the same sequence

use std::fmt;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::suite::SuiteVersion;

/// Size of symmetric keys, seeds and key identifiers.
pub const KEY_SIZE: usize = 32;

/// Salt for the self-ratchet HKDF extract
const SELF_RATCHET_SALT: &[u8] = b"keyloomSelfRatchetV1";

/// Info label for the self-ratchet HKDF expand
const SELF_RATCHET_INFO: &[u8] = b"seed|key-id|key";

/// Opaque tag naming one key among a provision's outputs.
///
/// Travels in the clear next to the ciphertext so the receiver can find the
/// matching key without trial decryption.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId([u8; KEY_SIZE]);

impl KeyId {
    /// Wrap raw identifier bytes.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Single-use symmetric key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Seed of a self-ratchet lineage. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetSeed([u8; KEY_SIZE]);

impl RatchetSeed {
    /// Wrap raw seed bytes.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for RatchetSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RatchetSeed(<redacted>)")
    }
}

impl Drop for RatchetSeed {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Output of one self-ratchet step.
#[derive(Debug, Clone)]
pub struct RatchetStep {
    /// Seed to use for the following step
    pub next_seed: RatchetSeed,
    /// Identifier of the emitted key
    pub key_id: KeyId,
    /// The emitted key
    pub key: SymmetricKey,
}

/// Advance a self-ratchet by one step.
///
/// Computes `(next_seed, key_id, key)` from `seed`. The caller must replace
/// its stored seed with `next_seed` and drop the old one.
pub fn ratchet_step(seed: &RatchetSeed, suite: SuiteVersion) -> RatchetStep {
    match suite {
        SuiteVersion::V1 => {
            let hkdf = Hkdf::<Sha256>::new(Some(SELF_RATCHET_SALT), seed.as_bytes());

            let mut okm = [0u8; 3 * KEY_SIZE];
            let Ok(()) = hkdf.expand(SELF_RATCHET_INFO, &mut okm) else {
                unreachable!("96 bytes is a valid HKDF-SHA256 output length");
            };

            let mut next_seed = [0u8; KEY_SIZE];
            let mut key_id = [0u8; KEY_SIZE];
            let mut key = [0u8; KEY_SIZE];
            next_seed.copy_from_slice(&okm[..KEY_SIZE]);
            key_id.copy_from_slice(&okm[KEY_SIZE..2 * KEY_SIZE]);
            key.copy_from_slice(&okm[2 * KEY_SIZE..]);
            okm.zeroize();

            let step = RatchetStep {
                next_seed: RatchetSeed::from_bytes(next_seed),
                key_id: KeyId::from_bytes(key_id),
                key: SymmetricKey::from_bytes(key),
            };
            next_seed.zeroize();
            key.zeroize();
            step
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seed() -> RatchetSeed {
        let mut seed = [0u8; KEY_SIZE];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        RatchetSeed::from_bytes(seed)
    }

    #[test]
    fn step_is_deterministic() {
        let a = ratchet_step(&test_seed(), SuiteVersion::V1);
        let b = ratchet_step(&test_seed(), SuiteVersion::V1);

        assert_eq!(a.next_seed, b.next_seed);
        assert_eq!(a.key_id, b.key_id);
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn step_outputs_are_distinct() {
        let step = ratchet_step(&test_seed(), SuiteVersion::V1);

        assert_ne!(step.next_seed.as_bytes(), step.key.as_bytes());
        assert_ne!(step.key_id.as_bytes(), step.key.as_bytes());
        assert_ne!(&step.next_seed, &test_seed());
    }

    #[test]
    fn chained_steps_produce_unique_keys() {
        let mut seed = test_seed();
        let mut ids = Vec::new();

        for _ in 0..16 {
            let step = ratchet_step(&seed, SuiteVersion::V1);
            assert!(!ids.contains(&step.key_id), "key ids must not repeat");
            ids.push(step.key_id);
            seed = step.next_seed;
        }
    }

    #[test]
    fn debug_never_prints_secret_bytes() {
        let step = ratchet_step(&test_seed(), SuiteVersion::V1);
        assert_eq!(format!("{:?}", step.key), "SymmetricKey(<redacted>)");
        assert_eq!(format!("{:?}", step.next_seed), "RatchetSeed(<redacted>)");
    }
}
