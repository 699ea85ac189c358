//! Secure channels between two devices.
//!
//! A channel owns an ordered set of provisions (epochs). Exactly one epoch is
//! active for encryption; decryption searches every epoch so late or
//! reordered units from an older epoch still open until its keys expire.
//!
//! # Invariants
//!
//! - `active_full_ratchet_count <= latest_full_ratchet_count`
//! - The active epoch always has a provision
//! - Epochs older than the active one are retired

use keyloom_crypto::{
    AuthenticatedEncryption, EpochSeeds, KeyId, Prng, SharedSecret, XChaCha20Poly1305Aead,
    derive_epoch_seeds,
};
use keyloom_proto::{DeviceUid, IdentityId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::EngineConfig,
    error::{ChannelError, LedgerError},
    ledger::{Provision, delete_empty_provisions, key_material},
    storage::{StorageError, Table, Transaction},
};

/// Identifies a channel from the point of view of one owned identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    /// Local identity
    pub owned_identity: IdentityId,
    /// Remote identity
    pub remote_identity: IdentityId,
    /// Remote device
    pub remote_device: DeviceUid,
}

impl ChannelId {
    /// Length of [`ChannelId::storage_key`].
    pub const STORAGE_KEY_SIZE: usize = 96;

    /// `owned || remote identity || remote device`. Prefix of every record
    /// the channel owns.
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(Self::STORAGE_KEY_SIZE);
        key.extend_from_slice(self.owned_identity.as_bytes());
        key.extend_from_slice(self.remote_identity.as_bytes());
        key.extend_from_slice(self.remote_device.as_bytes());
        key
    }

    /// Recover a channel id from the first 96 bytes of a storage key.
    pub fn from_storage_key(key: &[u8]) -> Option<Self> {
        if key.len() < Self::STORAGE_KEY_SIZE {
            return None;
        }
        let part = |i: usize| {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&key[i * 32..(i + 1) * 32]);
            bytes
        };
        Some(Self {
            owned_identity: IdentityId::from_bytes(part(0)),
            remote_identity: IdentityId::from_bytes(part(1)),
            remote_device: DeviceUid::from_bytes(part(2)),
        })
    }
}

/// Endpoint label fed into seed derivation: `identity || device`.
fn endpoint(identity: &IdentityId, device: &DeviceUid) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(identity.as_bytes());
    out[32..].copy_from_slice(device.as_bytes());
    out
}

/// Channel record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id
    pub id: ChannelId,
    /// Local device the channel belongs to
    pub current_device: DeviceUid,
    /// Handshake completed
    pub confirmed: bool,
    /// Epoch used to encrypt new outbound units
    pub active_full_ratchet_count: u64,
    /// Newest epoch created
    pub latest_full_ratchet_count: u64,
}

impl Channel {
    /// Create a channel with epoch 0 seeded from `shared`.
    ///
    /// Replaces any existing channel with the same id, including its
    /// provisions and key material. The first provision is filled
    /// immediately.
    pub fn create(
        txn: &mut Transaction<'_>,
        id: ChannelId,
        current_device: DeviceUid,
        shared: &SharedSecret,
        config: &EngineConfig,
    ) -> Result<Self, ChannelError> {
        if let Some(existing) = Self::load(txn, &id)? {
            existing.delete(txn)?;
        }

        let channel = Self {
            id,
            current_device,
            confirmed: false,
            active_full_ratchet_count: 0,
            latest_full_ratchet_count: 0,
        };

        let seeds = channel.derive_seeds(shared, 0, config);
        let mut provision = Provision::new(id, 0, seeds, config.suite);
        provision.save(txn)?;
        provision.self_ratchet_if_required(txn, config)?;
        channel.save(txn)?;

        info!(channel = ?id, "channel created");
        Ok(channel)
    }

    fn derive_seeds(
        &self,
        shared: &SharedSecret,
        full_ratchet_count: u64,
        config: &EngineConfig,
    ) -> EpochSeeds {
        derive_epoch_seeds(
            shared,
            full_ratchet_count,
            &endpoint(&self.id.owned_identity, &self.current_device),
            &endpoint(&self.id.remote_identity, &self.id.remote_device),
            config.suite,
        )
    }

    /// Load a channel.
    pub fn load(txn: &Transaction<'_>, id: &ChannelId) -> Result<Option<Self>, StorageError> {
        txn.get(Table::Channels, &id.storage_key())
    }

    /// Load a channel that must exist.
    pub fn require(txn: &Transaction<'_>, id: &ChannelId) -> Result<Self, ChannelError> {
        Self::load(txn, id)?.ok_or(ChannelError::UnknownChannel(*id))
    }

    /// Every channel of an owned identity.
    pub fn load_for_identity(
        txn: &Transaction<'_>,
        owned_identity: &IdentityId,
    ) -> Result<Vec<Self>, StorageError> {
        Ok(txn
            .scan(Table::Channels, owned_identity.as_bytes())?
            .into_iter()
            .map(|(_, channel)| channel)
            .collect())
    }

    /// Every channel in storage.
    pub fn load_all(txn: &Transaction<'_>) -> Result<Vec<Self>, StorageError> {
        Ok(txn.scan(Table::Channels, &[])?.into_iter().map(|(_, channel)| channel).collect())
    }

    /// Persist the channel record.
    pub fn save(&self, txn: &mut Transaction<'_>) -> Result<(), StorageError> {
        txn.put(Table::Channels, self.id.storage_key(), self)
    }

    /// Delete the channel with all its provisions and keys.
    pub fn delete(&self, txn: &mut Transaction<'_>) -> Result<(), StorageError> {
        for provision in Provision::load_all(txn, &self.id)? {
            provision.delete(txn)?;
        }
        for material in key_material::for_channel(txn, &self.id)? {
            key_material::remove(txn, &self.id, &material.key_id);
        }
        txn.delete(Table::Channels, &self.id.storage_key());
        Ok(())
    }

    /// Mark the handshake complete.
    pub fn confirm(&mut self, txn: &mut Transaction<'_>) -> Result<(), StorageError> {
        self.confirmed = true;
        self.save(txn)
    }

    /// Every provision of this channel, oldest first.
    pub fn provisions(&self, txn: &Transaction<'_>) -> Result<Vec<Provision>, StorageError> {
        Provision::load_all(txn, &self.id)
    }

    fn active_provision(&self, txn: &Transaction<'_>) -> Result<Provision, ChannelError> {
        Provision::load(txn, &self.id, self.active_full_ratchet_count)?.ok_or(
            ChannelError::NoActiveProvision { full_ratchet_count: self.active_full_ratchet_count },
        )
    }

    /// Encrypt an outbound unit with the next send key of the active epoch.
    ///
    /// Tops up the active epoch's receive keys first. Returns the key id to
    /// put next to the ciphertext.
    pub fn encrypt(
        &self,
        txn: &mut Transaction<'_>,
        plaintext: &[u8],
        prng: &mut dyn Prng,
        config: &EngineConfig,
    ) -> Result<(KeyId, Vec<u8>), ChannelError> {
        let mut provision = self.active_provision(txn)?;
        provision.self_ratchet_if_required(txn, config)?;

        let (key_id, key) = provision.next_send_key(txn)?;
        let ciphertext = XChaCha20Poly1305Aead.encrypt(key.as_bytes(), plaintext, prng)?;
        Ok((key_id, ciphertext))
    }

    /// Decrypt an inbound unit.
    ///
    /// Looks the key up across every epoch. On success the key is deleted
    /// and its epoch replenished. Expired keys are treated as absent. A key
    /// that fails to authenticate the unit is kept.
    ///
    /// # Errors
    ///
    /// - `NoMatchingKey` if no usable key has this id (transient)
    /// - `Crypto` if the unit does not authenticate under the key
    pub fn decrypt(
        &self,
        txn: &mut Transaction<'_>,
        key_id: &KeyId,
        ciphertext: &[u8],
        now: u64,
        config: &EngineConfig,
    ) -> Result<Vec<u8>, ChannelError> {
        self.open(txn, key_id, ciphertext, now, config).map(|(plaintext, _)| plaintext)
    }

    /// Decrypt an inbound unit and follow the sender onto a newer epoch.
    ///
    /// A unit that opens under an epoch newer than the active one proves the
    /// remote end holds and uses that epoch, so it becomes active here too.
    /// This completes a full ratchet whose acknowledgement was lost.
    pub fn receive(
        &mut self,
        txn: &mut Transaction<'_>,
        key_id: &KeyId,
        ciphertext: &[u8],
        now: u64,
        config: &EngineConfig,
    ) -> Result<Vec<u8>, ChannelError> {
        let (plaintext, full_ratchet_count) = self.open(txn, key_id, ciphertext, now, config)?;
        if full_ratchet_count > self.active_full_ratchet_count {
            info!(channel = ?self.id, epoch = full_ratchet_count, "remote switched epoch");
            self.activate(txn, full_ratchet_count, now, config)?;
        }
        Ok(plaintext)
    }

    fn open(
        &self,
        txn: &mut Transaction<'_>,
        key_id: &KeyId,
        ciphertext: &[u8],
        now: u64,
        config: &EngineConfig,
    ) -> Result<(Vec<u8>, u64), ChannelError> {
        let material = key_material::find(txn, &self.id, key_id)?
            .filter(|material| !material.is_expired(now))
            .ok_or(ChannelError::NoMatchingKey { key_id: *key_id })?;

        let plaintext = XChaCha20Poly1305Aead.decrypt(material.key.as_bytes(), ciphertext)?;
        key_material::remove(txn, &self.id, key_id);

        let mut provision = Provision::load(txn, &self.id, material.full_ratchet_count)?.ok_or(
            LedgerError::ProvisionNotFound { full_ratchet_count: material.full_ratchet_count },
        )?;
        provision.self_ratchet_if_required(txn, config)?;

        debug!(
            channel = ?self.id,
            epoch = material.full_ratchet_count,
            index = material.self_ratchet_index,
            "decrypted unit"
        );
        Ok((plaintext, material.full_ratchet_count))
    }

    /// Smallest epoch number a new full ratchet may use.
    pub fn next_full_ratchet_count(&self) -> u64 {
        self.latest_full_ratchet_count.saturating_add(1)
    }

    /// Start epoch `full_ratchet_count` from a fresh agreement.
    ///
    /// The epoch must be newer than every existing one; epochs are never
    /// replaced. Numbers may be skipped when an earlier exchange was
    /// abandoned. With `activate`, the new epoch also becomes the
    /// encrypting one and older epochs are retired.
    ///
    /// # Errors
    ///
    /// `StaleEpoch` if `full_ratchet_count <= latest_full_ratchet_count`.
    pub fn apply_full_ratchet(
        &mut self,
        txn: &mut Transaction<'_>,
        shared: &SharedSecret,
        full_ratchet_count: u64,
        activate: bool,
        now: u64,
        config: &EngineConfig,
    ) -> Result<(), ChannelError> {
        if full_ratchet_count <= self.latest_full_ratchet_count {
            return Err(ChannelError::StaleEpoch {
                full_ratchet_count,
                latest: self.latest_full_ratchet_count,
            });
        }

        let seeds = self.derive_seeds(shared, full_ratchet_count, config);
        let mut provision = Provision::new(self.id, full_ratchet_count, seeds, config.suite);
        provision.save(txn)?;
        provision.self_ratchet_if_required(txn, config)?;

        self.latest_full_ratchet_count = full_ratchet_count;
        if activate {
            self.activate(txn, full_ratchet_count, now, config)?;
        } else {
            self.save(txn)?;
        }

        info!(channel = ?self.id, epoch = full_ratchet_count, activate, "full ratchet applied");
        Ok(())
    }

    /// Make an existing epoch the encrypting one and retire every older
    /// epoch. Keys of retired epochs expire after the configured grace.
    ///
    /// Activation only moves forward: an epoch at or below the active one is
    /// left alone.
    pub fn activate(
        &mut self,
        txn: &mut Transaction<'_>,
        full_ratchet_count: u64,
        now: u64,
        config: &EngineConfig,
    ) -> Result<(), ChannelError> {
        if full_ratchet_count <= self.active_full_ratchet_count {
            return Ok(());
        }
        if Provision::load(txn, &self.id, full_ratchet_count)?.is_none() {
            return Err(LedgerError::ProvisionNotFound { full_ratchet_count }.into());
        }

        let expires_at = now.saturating_add(config.expiring_key_grace_secs);
        for mut provision in self.provisions(txn)? {
            if provision.full_ratchet_count < full_ratchet_count && !provision.retired {
                let expiring = provision.retire(txn, expires_at)?;
                debug!(
                    channel = ?self.id,
                    epoch = provision.full_ratchet_count,
                    expiring,
                    "retired epoch"
                );
            }
        }

        self.active_full_ratchet_count = full_ratchet_count;
        self.save(txn)?;
        Ok(())
    }

    /// Delete epochs that hold no keys, except the active one.
    pub fn delete_empty_provisions(
        &self,
        txn: &mut Transaction<'_>,
    ) -> Result<Vec<u64>, ChannelError> {
        Ok(delete_empty_provisions(txn, &self.id, self.active_full_ratchet_count)?)
    }
}

#[cfg(test)]
mod tests {
    use keyloom_crypto::SeededPrng;

    use super::*;
    use crate::storage::MemoryStorage;

    fn ids() -> (ChannelId, ChannelId, DeviceUid, DeviceUid) {
        let alice = IdentityId::from_bytes([0xA1; 32]);
        let bob = IdentityId::from_bytes([0xB0; 32]);
        let alice_device = DeviceUid::from_bytes([0xA2; 32]);
        let bob_device = DeviceUid::from_bytes([0xB2; 32]);
        (
            ChannelId { owned_identity: alice, remote_identity: bob, remote_device: bob_device },
            ChannelId { owned_identity: bob, remote_identity: alice, remote_device: alice_device },
            alice_device,
            bob_device,
        )
    }

    fn config() -> EngineConfig {
        EngineConfig { reprovisioning_threshold: 3, ..Default::default() }
    }

    #[test]
    fn storage_key_roundtrip() {
        let (id, ..) = ids();
        assert_eq!(ChannelId::from_storage_key(&id.storage_key()), Some(id));
        assert_eq!(ChannelId::from_storage_key(&[0; 10]), None);
    }

    #[test]
    fn both_ends_exchange_units() {
        let alice_store = MemoryStorage::new();
        let bob_store = MemoryStorage::new();
        let (alice_id, bob_id, alice_device, bob_device) = ids();
        let shared = SharedSecret::from_bytes([5; 32]);
        let mut prng = SeededPrng::from_u64(3);

        let mut alice_txn = Transaction::begin(&alice_store);
        let alice =
            Channel::create(&mut alice_txn, alice_id, alice_device, &shared, &config()).unwrap();
        let mut bob_txn = Transaction::begin(&bob_store);
        let bob = Channel::create(&mut bob_txn, bob_id, bob_device, &shared, &config()).unwrap();

        let (key_id, ciphertext) =
            alice.encrypt(&mut alice_txn, b"hello bob", &mut prng, &config()).unwrap();
        let plaintext = bob.decrypt(&mut bob_txn, &key_id, &ciphertext, 0, &config()).unwrap();
        assert_eq!(plaintext, b"hello bob");

        let (key_id, ciphertext) = bob.encrypt(&mut bob_txn, b"hi", &mut prng, &config()).unwrap();
        let plaintext = alice.decrypt(&mut alice_txn, &key_id, &ciphertext, 0, &config()).unwrap();
        assert_eq!(plaintext, b"hi");
    }

    #[test]
    fn expired_key_is_not_usable() {
        let storage = MemoryStorage::new();
        let (id, _, device, _) = ids();
        let mut txn = Transaction::begin(&storage);
        let channel =
            Channel::create(&mut txn, id, device, &SharedSecret::from_bytes([1; 32]), &config())
                .unwrap();

        let key = key_material::for_channel(&txn, &id).unwrap().remove(0);
        key_material::mark_expiring(&mut txn, &id, 0, 100).unwrap();

        let result = channel.decrypt(&mut txn, &key.key_id, &[0; 64], 100, &config());
        assert_eq!(result, Err(ChannelError::NoMatchingKey { key_id: key.key_id }));
    }

    #[test]
    fn activate_unknown_epoch_fails() {
        let storage = MemoryStorage::new();
        let (id, _, device, _) = ids();
        let mut txn = Transaction::begin(&storage);
        let mut channel =
            Channel::create(&mut txn, id, device, &SharedSecret::from_bytes([1; 32]), &config())
                .unwrap();

        let result = channel.activate(&mut txn, 4, 0, &config());
        assert_eq!(
            result,
            Err(ChannelError::Ledger(LedgerError::ProvisionNotFound { full_ratchet_count: 4 }))
        );
    }

    #[test]
    fn unit_under_pending_epoch_activates_it() {
        let alice_store = MemoryStorage::new();
        let bob_store = MemoryStorage::new();
        let (alice_id, bob_id, alice_device, bob_device) = ids();
        let shared = SharedSecret::from_bytes([5; 32]);
        let next = SharedSecret::from_bytes([8; 32]);
        let mut prng = SeededPrng::from_u64(4);

        let mut alice_txn = Transaction::begin(&alice_store);
        let mut alice =
            Channel::create(&mut alice_txn, alice_id, alice_device, &shared, &config()).unwrap();
        alice.apply_full_ratchet(&mut alice_txn, &next, 1, true, 0, &config()).unwrap();

        let mut bob_txn = Transaction::begin(&bob_store);
        let mut bob =
            Channel::create(&mut bob_txn, bob_id, bob_device, &shared, &config()).unwrap();
        bob.apply_full_ratchet(&mut bob_txn, &next, 1, false, 0, &config()).unwrap();
        assert_eq!(bob.active_full_ratchet_count, 0);

        let (key_id, ciphertext) =
            alice.encrypt(&mut alice_txn, b"epoch one", &mut prng, &config()).unwrap();
        let plaintext = bob.receive(&mut bob_txn, &key_id, &ciphertext, 0, &config()).unwrap();

        assert_eq!(plaintext, b"epoch one");
        assert_eq!(bob.active_full_ratchet_count, 1);
        assert_eq!(Channel::load(&bob_txn, &bob_id).unwrap(), Some(bob));
    }

    #[test]
    fn epochs_only_move_forward() {
        let storage = MemoryStorage::new();
        let (id, _, device, _) = ids();
        let mut txn = Transaction::begin(&storage);
        let mut channel =
            Channel::create(&mut txn, id, device, &SharedSecret::from_bytes([1; 32]), &config())
                .unwrap();
        let shared = SharedSecret::from_bytes([2; 32]);

        channel.apply_full_ratchet(&mut txn, &shared, 3, true, 0, &config()).unwrap();
        assert_eq!(
            channel.apply_full_ratchet(&mut txn, &shared, 3, false, 0, &config()),
            Err(ChannelError::StaleEpoch { full_ratchet_count: 3, latest: 3 })
        );
        assert_eq!(channel.next_full_ratchet_count(), 4);

        channel.activate(&mut txn, 0, 0, &config()).unwrap();
        assert_eq!(channel.active_full_ratchet_count, 3);
    }

    #[test]
    fn recreate_replaces_old_keys() {
        let storage = MemoryStorage::new();
        let (id, _, device, _) = ids();
        let mut txn = Transaction::begin(&storage);

        Channel::create(&mut txn, id, device, &SharedSecret::from_bytes([1; 32]), &config())
            .unwrap();
        let first: Vec<KeyId> =
            key_material::for_channel(&txn, &id).unwrap().iter().map(|k| k.key_id).collect();

        Channel::create(&mut txn, id, device, &SharedSecret::from_bytes([2; 32]), &config())
            .unwrap();
        let second = key_material::for_channel(&txn, &id).unwrap();

        assert_eq!(second.len(), 6);
        assert!(second.iter().all(|k| !first.contains(&k.key_id)));
    }
}
