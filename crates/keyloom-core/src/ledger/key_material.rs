//! Single-use receive keys.
//!
//! Key material is stored per channel, keyed by key id, so an inbound unit
//! finds its key with one point read regardless of which epoch emitted it.

use keyloom_crypto::{KeyId, SymmetricKey};
use serde::{Deserialize, Serialize};

use crate::{
    channel::ChannelId,
    storage::{StorageError, Table, Transaction},
};

/// One derived receive key.
///
/// # Invariants
///
/// - Used for at most one successful decryption, then deleted
/// - `self_ratchet_index` is its position in the provision's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// Identifier the sender puts next to the ciphertext
    pub key_id: KeyId,
    /// Symmetric key
    pub key: SymmetricKey,
    /// Epoch that emitted this key
    pub full_ratchet_count: u64,
    /// Position in the epoch's output sequence
    pub self_ratchet_index: u64,
    /// Unix seconds after which the key is unusable. `None` = not expiring.
    pub expires_at: Option<u64>,
}

impl KeyMaterial {
    /// True once the key has been scheduled for expiry.
    pub fn is_expiring(&self) -> bool {
        self.expires_at.is_some()
    }

    /// True if the key can no longer be used at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn storage_key(channel: &ChannelId, key_id: &KeyId) -> Vec<u8> {
    let mut key = channel.storage_key();
    key.extend_from_slice(key_id.as_bytes());
    key
}

/// Persist a key.
pub fn store(
    txn: &mut Transaction<'_>,
    channel: &ChannelId,
    material: &KeyMaterial,
) -> Result<(), StorageError> {
    txn.put(Table::KeyMaterials, storage_key(channel, &material.key_id), material)
}

/// Find a key of a channel by id, across all epochs.
pub fn find(
    txn: &Transaction<'_>,
    channel: &ChannelId,
    key_id: &KeyId,
) -> Result<Option<KeyMaterial>, StorageError> {
    txn.get(Table::KeyMaterials, &storage_key(channel, key_id))
}

/// Delete a key.
pub fn remove(txn: &mut Transaction<'_>, channel: &ChannelId, key_id: &KeyId) {
    txn.delete(Table::KeyMaterials, &storage_key(channel, key_id));
}

/// Every key held for a channel.
pub fn for_channel(
    txn: &Transaction<'_>,
    channel: &ChannelId,
) -> Result<Vec<KeyMaterial>, StorageError> {
    Ok(txn
        .scan(Table::KeyMaterials, &channel.storage_key())?
        .into_iter()
        .map(|(_, material)| material)
        .collect())
}

/// Every key emitted by one epoch of a channel.
pub fn for_provision(
    txn: &Transaction<'_>,
    channel: &ChannelId,
    full_ratchet_count: u64,
) -> Result<Vec<KeyMaterial>, StorageError> {
    Ok(for_channel(txn, channel)?
        .into_iter()
        .filter(|material| material.full_ratchet_count == full_ratchet_count)
        .collect())
}

/// Schedule every key of an epoch for expiry at `expires_at`.
///
/// Keys already expiring earlier keep their deadline. Returns the number of
/// keys whose deadline changed.
pub fn mark_expiring(
    txn: &mut Transaction<'_>,
    channel: &ChannelId,
    full_ratchet_count: u64,
    expires_at: u64,
) -> Result<usize, StorageError> {
    let mut changed = 0;
    for mut material in for_provision(txn, channel, full_ratchet_count)? {
        if material.expires_at.is_some_and(|at| at <= expires_at) {
            continue;
        }
        material.expires_at = Some(expires_at);
        store(txn, channel, &material)?;
        changed += 1;
    }
    Ok(changed)
}

/// Delete every expired key in storage. Returns the number deleted.
pub fn delete_expired(txn: &mut Transaction<'_>, now: u64) -> Result<usize, StorageError> {
    let expired: Vec<Vec<u8>> = txn
        .scan::<KeyMaterial>(Table::KeyMaterials, &[])?
        .into_iter()
        .filter(|(_, material)| material.is_expired(now))
        .map(|(key, _)| key)
        .collect();

    for key in &expired {
        txn.delete(Table::KeyMaterials, key);
    }
    Ok(expired.len())
}
