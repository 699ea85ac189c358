//! Epoch seed derivation and handshake transcripts

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{
    agreement::SharedSecret,
    ratchet::{KEY_SIZE, RatchetSeed},
    suite::SuiteVersion,
};

type HmacSha256 = Hmac<Sha256>;

/// Label used for epoch seed derivation
const EPOCH_SEED_LABEL: &[u8] = b"keyloomEpochSeedV1";

/// Label used for key confirmation tags
const CONFIRMATION_LABEL: &[u8] = b"keyloomConfirmV1";

/// Salt used when combining several agreements into one secret
const COMBINE_SALT: &[u8] = b"keyloomCombineV1";

/// Pair of seeds for one epoch of a channel, seen from the local device.
///
/// The local `send` seed equals the remote device's `receive` seed for the
/// same epoch.
#[derive(Debug, Clone)]
pub struct EpochSeeds {
    /// Seed for keys this device encrypts with
    pub send: RatchetSeed,
    /// Seed for keys this device decrypts with
    pub receive: RatchetSeed,
}

/// Derive both direction seeds for an epoch.
///
/// `local` and `remote` identify the two endpoints (identity followed by
/// device). Swapping them swaps the resulting seeds, which is what makes the
/// two ends of a channel agree.
pub fn derive_epoch_seeds(
    shared_secret: &SharedSecret,
    full_ratchet_count: u64,
    local: &[u8],
    remote: &[u8],
    suite: SuiteVersion,
) -> EpochSeeds {
    EpochSeeds {
        send: derive_direction_seed(shared_secret, full_ratchet_count, local, remote, suite),
        receive: derive_direction_seed(shared_secret, full_ratchet_count, remote, local, suite),
    }
}

fn derive_direction_seed(
    shared_secret: &SharedSecret,
    full_ratchet_count: u64,
    from: &[u8],
    to: &[u8],
    suite: SuiteVersion,
) -> RatchetSeed {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());

    // label || suite || count || len(from) || from || to
    let mut info = Vec::with_capacity(EPOCH_SEED_LABEL.len() + 13 + from.len() + to.len());
    info.extend_from_slice(EPOCH_SEED_LABEL);
    info.push(suite.as_u8());
    info.extend_from_slice(&full_ratchet_count.to_be_bytes());
    info.extend_from_slice(&(from.len() as u32).to_be_bytes());
    info.extend_from_slice(from);
    info.extend_from_slice(to);

    let mut seed = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(&info, &mut seed) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    RatchetSeed::from_bytes(seed)
}

/// Combine several agreement results into one secret.
///
/// Order matters: both ends must pass the agreements in the same order.
pub fn combine_secrets(parts: &[&SharedSecret]) -> SharedSecret {
    let mut ikm = Vec::with_capacity(parts.len() * KEY_SIZE);
    for part in parts {
        ikm.extend_from_slice(part.as_bytes());
    }

    let hkdf = Hkdf::<Sha256>::new(Some(COMBINE_SALT), &ikm);
    ikm.zeroize();

    let mut combined = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(&[], &mut combined) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    let secret = SharedSecret::from_bytes(combined);
    combined.zeroize();
    secret
}

/// Hash of an ordered list of handshake values.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn transcript_hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Key confirmation tag binding a transcript to an agreed secret.
pub fn confirmation_tag(shared_secret: &SharedSecret, transcript: &[u8; 32]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(shared_secret.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(CONFIRMATION_LABEL);
    mac.update(transcript);
    mac.finalize().into_bytes().into()
}
