//! X25519 key agreement and sealed boxes
//!
//! Agreement key pairs are used twice: as long-term identity keys (the
//! asymmetric bootstrap channel seals messages to them) and as ephemeral keys
//! inside channel-creation and full-ratchet handshakes. Secrets are kept as
//! raw bytes so a pending handshake can be persisted in protocol state.

use std::fmt;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{
    aead::{AuthenticatedEncryption, XChaCha20Poly1305Aead},
    error::CryptoError,
    prng::Prng,
    ratchet::KEY_SIZE,
};

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Label for sealed-box key derivation
const SEALED_BOX_LABEL: &[u8] = b"keyloomSealedBoxV1";

/// Result of an X25519 agreement. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    /// Wrap raw secret bytes.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// X25519 key pair with a persistable secret.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgreementKeyPair {
    secret: [u8; KEY_SIZE],
    public: [u8; PUBLIC_KEY_SIZE],
}

impl AgreementKeyPair {
    /// Generate a key pair from `prng`.
    pub fn generate<P: Prng + ?Sized>(prng: &mut P) -> Self {
        let mut secret = prng.random_32();
        let pair = Self::from_secret_bytes(secret);
        secret.zeroize();
        pair
    }

    /// Rebuild a key pair from its secret bytes.
    pub fn from_secret_bytes(secret: [u8; KEY_SIZE]) -> Self {
        let static_secret = StaticSecret::from(secret);
        let public = PublicKey::from(&static_secret).to_bytes();
        Self { secret: static_secret.to_bytes(), public }
    }

    /// Public half.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public
    }

    /// Agree on a secret with a peer's public key.
    ///
    /// # Errors
    ///
    /// - `InvalidPublicKey` if the peer key is a low-order point
    pub fn agree(
        &self,
        remote_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<SharedSecret, CryptoError> {
        let secret = StaticSecret::from(self.secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*remote_public));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(SharedSecret::from_bytes(shared.to_bytes()))
    }
}

impl fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgreementKeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

impl Drop for AgreementKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Seal `plaintext` to a recipient's public key.
///
/// Output layout: `ephemeral public key (32 bytes) || AEAD ciphertext`.
pub fn seal<P: Prng + ?Sized>(
    recipient: &[u8; PUBLIC_KEY_SIZE],
    plaintext: &[u8],
    prng: &mut P,
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = AgreementKeyPair::generate(prng);
    let shared = ephemeral.agree(recipient)?;
    let key = sealed_box_key(&shared, &ephemeral.public_key(), recipient);

    let sealed = XChaCha20Poly1305Aead.encrypt(&key, plaintext, prng)?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + sealed.len());
    out.extend_from_slice(&ephemeral.public_key());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a sealed box addressed to `recipient`.
///
/// # Errors
///
/// - `IncorrectBlockSize` if the box is truncated
/// - `DecryptionFailed` if it was not sealed to this key or was tampered with
pub fn open_sealed(recipient: &AgreementKeyPair, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < PUBLIC_KEY_SIZE {
        return Err(CryptoError::IncorrectBlockSize {
            minimum: PUBLIC_KEY_SIZE,
            actual: sealed.len(),
        });
    }

    let (ephemeral_public, ciphertext) = sealed.split_at(PUBLIC_KEY_SIZE);
    let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
    ephemeral.copy_from_slice(ephemeral_public);

    let shared = recipient.agree(&ephemeral)?;
    let key = sealed_box_key(&shared, &ephemeral, &recipient.public_key());

    XChaCha20Poly1305Aead.decrypt(&key, ciphertext)
}

fn sealed_box_key(
    shared: &SharedSecret,
    ephemeral: &[u8; PUBLIC_KEY_SIZE],
    recipient: &[u8; PUBLIC_KEY_SIZE],
) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(Some(SEALED_BOX_LABEL), shared.as_bytes());

    let mut info = [0u8; 2 * PUBLIC_KEY_SIZE];
    info[..PUBLIC_KEY_SIZE].copy_from_slice(ephemeral);
    info[PUBLIC_KEY_SIZE..].copy_from_slice(recipient);

    let mut key = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}
