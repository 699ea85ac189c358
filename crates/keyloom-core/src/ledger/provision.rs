//! Provisions: one ratchet epoch of a channel.
//!
//! A provision owns two seed lineages agreed during a handshake or full
//! ratchet. The receive lineage is expanded ahead of time into stored
//! [`KeyMaterial`]; the send lineage is advanced one step per outbound unit.
//!
//! # Invariants
//!
//! - At most one provision exists per `(channel, full_ratchet_count)`; the
//!   pair is the storage key
//! - `self_ratchet_count` and `send_count` only increase
//! - After `self_ratchet_if_required` on a non-retired provision, at least
//!   `threshold` not-yet-expiring receive keys are held

use keyloom_crypto::{
    CryptoError, EpochSeeds, KeyId, RatchetSeed, RatchetStep, SuiteVersion, SymmetricKey,
    ratchet_step,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::key_material::{self, KeyMaterial};
use crate::{
    channel::ChannelId,
    config::EngineConfig,
    error::LedgerError,
    storage::{StorageError, Table, Transaction},
};

/// One epoch of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    /// Owning channel
    pub channel: ChannelId,
    /// Epoch number
    pub full_ratchet_count: u64,
    /// Number of receive keys ever derived
    pub self_ratchet_count: u64,
    /// Number of send keys ever used
    pub send_count: u64,
    /// Superseded by a newer epoch; no longer replenished
    pub retired: bool,
    suite: u8,
    receive_seed: RatchetSeed,
    send_seed: RatchetSeed,
}

impl Provision {
    /// New, empty epoch. Nothing is derived or stored yet.
    pub fn new(
        channel: ChannelId,
        full_ratchet_count: u64,
        seeds: EpochSeeds,
        suite: SuiteVersion,
    ) -> Self {
        let EpochSeeds { send, receive } = seeds;
        Self {
            channel,
            full_ratchet_count,
            self_ratchet_count: 0,
            send_count: 0,
            retired: false,
            suite: suite.as_u8(),
            receive_seed: receive,
            send_seed: send,
        }
    }

    fn storage_key(channel: &ChannelId, full_ratchet_count: u64) -> Vec<u8> {
        let mut key = channel.storage_key();
        key.extend_from_slice(&full_ratchet_count.to_be_bytes());
        key
    }

    /// Suite this epoch was created with.
    ///
    /// # Errors
    ///
    /// - `UnsupportedSuite` if the stored suite is unknown to this build
    pub fn suite(&self) -> Result<SuiteVersion, CryptoError> {
        SuiteVersion::try_from(self.suite)
    }

    /// Load one epoch.
    pub fn load(
        txn: &Transaction<'_>,
        channel: &ChannelId,
        full_ratchet_count: u64,
    ) -> Result<Option<Self>, StorageError> {
        txn.get(Table::Provisions, &Self::storage_key(channel, full_ratchet_count))
    }

    /// Every epoch of a channel, oldest first.
    pub fn load_all(txn: &Transaction<'_>, channel: &ChannelId) -> Result<Vec<Self>, StorageError> {
        Ok(txn
            .scan(Table::Provisions, &channel.storage_key())?
            .into_iter()
            .map(|(_, provision)| provision)
            .collect())
    }

    /// Persist this epoch.
    pub fn save(&self, txn: &mut Transaction<'_>) -> Result<(), StorageError> {
        txn.put(Table::Provisions, Self::storage_key(&self.channel, self.full_ratchet_count), self)
    }

    /// Delete this epoch and any key material it still holds.
    pub fn delete(&self, txn: &mut Transaction<'_>) -> Result<(), StorageError> {
        for material in key_material::for_provision(txn, &self.channel, self.full_ratchet_count)? {
            key_material::remove(txn, &self.channel, &material.key_id);
        }
        txn.delete(Table::Provisions, &Self::storage_key(&self.channel, self.full_ratchet_count));
        Ok(())
    }

    /// Derive `count` more receive keys.
    ///
    /// Each step replaces the receive seed with the next one in the lineage,
    /// so the stored seed never reveals keys derived before it. Persists the
    /// keys and the advanced provision.
    ///
    /// # Errors
    ///
    /// - `Crypto(UnsupportedSuite)` if the stored suite is unknown (fatal)
    /// - `Storage` if a write cannot be encoded
    pub fn self_ratchet(
        &mut self,
        txn: &mut Transaction<'_>,
        count: u64,
    ) -> Result<Vec<KeyMaterial>, LedgerError> {
        let suite = self.suite()?;
        let mut emitted = Vec::with_capacity(usize::try_from(count).unwrap_or(0));

        for _ in 0..count {
            let RatchetStep { next_seed, key_id, key } = ratchet_step(&self.receive_seed, suite);
            let material = KeyMaterial {
                key_id,
                key,
                full_ratchet_count: self.full_ratchet_count,
                self_ratchet_index: self.self_ratchet_count,
                expires_at: None,
            };

            key_material::store(txn, &self.channel, &material)?;
            self.receive_seed = next_seed;
            self.self_ratchet_count += 1;
            emitted.push(material);
        }

        self.save(txn)?;

        trace!(
            epoch = self.full_ratchet_count,
            derived = count,
            total = self.self_ratchet_count,
            "self-ratchet"
        );
        Ok(emitted)
    }

    /// Top up the receive keys if fewer than `threshold` are held.
    ///
    /// Fills to `2 × threshold` on the first fill of the epoch and to
    /// `threshold` afterwards. Retired epochs are never replenished. Returns
    /// the number of keys derived.
    pub fn self_ratchet_if_required(
        &mut self,
        txn: &mut Transaction<'_>,
        config: &EngineConfig,
    ) -> Result<u64, LedgerError> {
        if self.retired {
            return Ok(0);
        }

        let held = self.count_not_expiring_receive_keys(txn)? as u64;
        if held >= config.reprovisioning_threshold {
            return Ok(0);
        }

        let target = config.refill_target(self.self_ratchet_count == 0);
        let missing = target - held;
        self.self_ratchet(txn, missing)?;

        debug!(epoch = self.full_ratchet_count, held, derived = missing, "replenished provision");
        Ok(missing)
    }

    /// Number of held receive keys not scheduled for expiry.
    pub fn count_not_expiring_receive_keys(
        &self,
        txn: &Transaction<'_>,
    ) -> Result<usize, LedgerError> {
        Ok(key_material::for_provision(txn, &self.channel, self.full_ratchet_count)?
            .iter()
            .filter(|material| !material.is_expiring())
            .count())
    }

    /// Number of held receive keys, expiring or not.
    pub fn held_keys(&self, txn: &Transaction<'_>) -> Result<usize, LedgerError> {
        Ok(key_material::for_provision(txn, &self.channel, self.full_ratchet_count)?.len())
    }

    /// Take the next key of the send lineage.
    ///
    /// Keys are used strictly in lineage order; the peer holds the same
    /// sequence as receive keys.
    pub fn next_send_key(
        &mut self,
        txn: &mut Transaction<'_>,
    ) -> Result<(KeyId, SymmetricKey), LedgerError> {
        let RatchetStep { next_seed, key_id, key } = ratchet_step(&self.send_seed, self.suite()?);
        self.send_seed = next_seed;
        self.send_count += 1;
        self.save(txn)?;
        Ok((key_id, key))
    }

    /// Mark this epoch superseded and schedule its keys for expiry.
    ///
    /// Returns the number of keys whose deadline changed.
    pub fn retire(
        &mut self,
        txn: &mut Transaction<'_>,
        expires_at: u64,
    ) -> Result<usize, LedgerError> {
        self.retired = true;
        self.save(txn)?;
        Ok(key_material::mark_expiring(txn, &self.channel, self.full_ratchet_count, expires_at)?)
    }
}

/// Delete every epoch of a channel that holds no key material, except the
/// active one. Returns the deleted epoch numbers.
pub fn delete_empty_provisions(
    txn: &mut Transaction<'_>,
    channel: &ChannelId,
    active_full_ratchet_count: u64,
) -> Result<Vec<u64>, LedgerError> {
    let mut deleted = Vec::new();
    for provision in Provision::load_all(txn, channel)? {
        if provision.full_ratchet_count == active_full_ratchet_count {
            continue;
        }
        if provision.held_keys(txn)? == 0 {
            provision.delete(txn)?;
            deleted.push(provision.full_ratchet_count);
        }
    }

    if !deleted.is_empty() {
        debug!(?channel, ?deleted, "deleted empty provisions");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use keyloom_proto::{DeviceUid, IdentityId};

    use super::*;
    use crate::storage::MemoryStorage;

    fn channel() -> ChannelId {
        ChannelId {
            owned_identity: IdentityId::from_bytes([1; 32]),
            remote_identity: IdentityId::from_bytes([2; 32]),
            remote_device: DeviceUid::from_bytes([3; 32]),
        }
    }

    fn seeds(byte: u8) -> EpochSeeds {
        EpochSeeds {
            send: RatchetSeed::from_bytes([byte; 32]),
            receive: RatchetSeed::from_bytes([byte.wrapping_add(1); 32]),
        }
    }

    fn config(threshold: u64) -> EngineConfig {
        EngineConfig { reprovisioning_threshold: threshold, ..Default::default() }
    }

    #[test]
    fn self_ratchet_advances_counter_and_stores_keys() {
        let storage = MemoryStorage::new();
        let mut txn = Transaction::begin(&storage);
        let mut provision = Provision::new(channel(), 0, seeds(1), SuiteVersion::V1);

        let keys = provision.self_ratchet(&mut txn, 5).unwrap();

        assert_eq!(keys.len(), 5);
        assert_eq!(provision.self_ratchet_count, 5);
        assert_eq!(provision.count_not_expiring_receive_keys(&txn).unwrap(), 5);
        let indices: Vec<u64> = keys.iter().map(|k| k.self_ratchet_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn first_fill_is_double_threshold() {
        let storage = MemoryStorage::new();
        let mut txn = Transaction::begin(&storage);
        let mut provision = Provision::new(channel(), 0, seeds(1), SuiteVersion::V1);

        assert_eq!(provision.self_ratchet_if_required(&mut txn, &config(4)).unwrap(), 8);
        assert_eq!(provision.self_ratchet_if_required(&mut txn, &config(4)).unwrap(), 0);
    }

    #[test]
    fn replenish_restores_threshold() {
        let storage = MemoryStorage::new();
        let mut txn = Transaction::begin(&storage);
        let mut provision = Provision::new(channel(), 0, seeds(1), SuiteVersion::V1);
        let keys = provision.self_ratchet(&mut txn, 3).unwrap();

        key_material::remove(&mut txn, &channel(), &keys[0].key_id);

        assert_eq!(provision.self_ratchet_if_required(&mut txn, &config(4)).unwrap(), 2);
        assert_eq!(provision.count_not_expiring_receive_keys(&txn).unwrap(), 4);
    }

    #[test]
    fn retired_provision_is_not_replenished() {
        let storage = MemoryStorage::new();
        let mut txn = Transaction::begin(&storage);
        let mut provision = Provision::new(channel(), 0, seeds(1), SuiteVersion::V1);
        provision.self_ratchet(&mut txn, 2).unwrap();

        assert_eq!(provision.retire(&mut txn, 1000).unwrap(), 2);

        assert_eq!(provision.count_not_expiring_receive_keys(&txn).unwrap(), 0);
        assert_eq!(provision.self_ratchet_if_required(&mut txn, &config(4)).unwrap(), 0);
    }

    #[test]
    fn send_lineage_mirrors_peer_receive_lineage() {
        let storage = MemoryStorage::new();
        let mut txn = Transaction::begin(&storage);

        let mut local = Provision::new(channel(), 0, seeds(1), SuiteVersion::V1);
        let peer_seeds = EpochSeeds {
            send: RatchetSeed::from_bytes([2; 32]),
            receive: RatchetSeed::from_bytes([1; 32]),
        };
        let mut peer = Provision::new(channel(), 1, peer_seeds, SuiteVersion::V1);
        let peer_keys = peer.self_ratchet(&mut txn, 3).unwrap();

        for expected in &peer_keys {
            let (key_id, key) = local.next_send_key(&mut txn).unwrap();
            assert_eq!(key_id, expected.key_id);
            assert_eq!(key, expected.key);
        }
        assert_eq!(local.send_count, 3);
    }

    #[test]
    fn unknown_suite_is_fatal() {
        let storage = MemoryStorage::new();
        let mut txn = Transaction::begin(&storage);
        let mut provision = Provision::new(channel(), 0, seeds(1), SuiteVersion::V1);
        provision.suite = 0xEE;

        let result = provision.self_ratchet(&mut txn, 1);
        assert_eq!(result, Err(LedgerError::Crypto(CryptoError::UnsupportedSuite(0xEE))));
    }

    #[test]
    fn empty_inactive_provisions_are_deleted() {
        let storage = MemoryStorage::new();
        let mut txn = Transaction::begin(&storage);

        let old = Provision::new(channel(), 0, seeds(1), SuiteVersion::V1);
        old.save(&mut txn).unwrap();
        let mut current = Provision::new(channel(), 1, seeds(3), SuiteVersion::V1);
        current.self_ratchet(&mut txn, 1).unwrap();
        let empty_active = Provision::new(channel(), 2, seeds(5), SuiteVersion::V1);
        empty_active.save(&mut txn).unwrap();

        let deleted = delete_empty_provisions(&mut txn, &channel(), 2).unwrap();

        assert_eq!(deleted, vec![0]);
        let remaining: Vec<u64> = Provision::load_all(&txn, &channel())
            .unwrap()
            .iter()
            .map(|p| p.full_ratchet_count)
            .collect();
        assert_eq!(remaining, vec![1, 2]);
    }
}
