//! Owned identities and the contact store.
//!
//! Both are collaborator state: protocol steps read and write them through
//! the step's transaction, so contact updates commit together with the
//! protocol state that caused them.

use std::collections::BTreeSet;

use keyloom_crypto::{AgreementKeyPair, Prng};
use keyloom_proto::{DeviceUid, IdentityId};
use serde::{Deserialize, Serialize};

use crate::storage::{StorageError, Table, Transaction};

/// An identity this engine acts for, with its X25519 key pair.
///
/// The identity id is the public key, so anyone holding the id can seal a
/// bootstrap message to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedIdentity {
    /// Public identity
    pub identity: IdentityId,
    /// Device this engine runs on
    pub current_device: DeviceUid,
    key_pair: AgreementKeyPair,
}

impl OwnedIdentity {
    /// Generate a fresh identity and device id.
    pub fn generate(prng: &mut dyn Prng) -> Self {
        let key_pair = AgreementKeyPair::generate(prng);
        let current_device = DeviceUid::from_bytes(prng.random_32());
        Self::from_key_pair(key_pair, current_device)
    }

    /// Build an identity from an existing key pair.
    ///
    /// Used to add a second device to an identity: every device of an
    /// identity shares its key pair.
    pub fn from_key_pair(key_pair: AgreementKeyPair, current_device: DeviceUid) -> Self {
        Self { identity: IdentityId::from_bytes(key_pair.public_key()), current_device, key_pair }
    }

    /// Identity key pair.
    pub fn key_pair(&self) -> &AgreementKeyPair {
        &self.key_pair
    }

    /// Load an owned identity.
    pub fn load(
        txn: &Transaction<'_>,
        identity: &IdentityId,
    ) -> Result<Option<Self>, StorageError> {
        txn.get(Table::Identities, identity.as_bytes())
    }

    /// Every owned identity.
    pub fn load_all(txn: &Transaction<'_>) -> Result<Vec<Self>, StorageError> {
        Ok(txn.scan(Table::Identities, &[])?.into_iter().map(|(_, identity)| identity).collect())
    }

    /// Persist this identity.
    pub fn save(&self, txn: &mut Transaction<'_>) -> Result<(), StorageError> {
        txn.put(Table::Identities, self.identity.as_bytes().to_vec(), self)
    }
}

/// Known devices of a contact, as seen by one owned identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Owning identity
    pub owned_identity: IdentityId,
    /// Contact identity
    pub contact_identity: IdentityId,
    /// Known devices
    pub devices: BTreeSet<DeviceUid>,
}

impl Contact {
    fn key(owned_identity: &IdentityId, contact_identity: &IdentityId) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(owned_identity.as_bytes());
        key.extend_from_slice(contact_identity.as_bytes());
        key
    }

    /// Load a contact.
    pub fn load(
        txn: &Transaction<'_>,
        owned_identity: &IdentityId,
        contact_identity: &IdentityId,
    ) -> Result<Option<Self>, StorageError> {
        txn.get(Table::Contacts, &Self::key(owned_identity, contact_identity))
    }

    /// All contacts of an owned identity.
    pub fn load_for_identity(
        txn: &Transaction<'_>,
        owned_identity: &IdentityId,
    ) -> Result<Vec<Self>, StorageError> {
        Ok(txn
            .scan(Table::Contacts, owned_identity.as_bytes())?
            .into_iter()
            .map(|(_, contact)| contact)
            .collect())
    }

    /// Record one device of a contact. Returns true if it was new.
    pub fn add_device(
        txn: &mut Transaction<'_>,
        owned_identity: IdentityId,
        contact_identity: IdentityId,
        device: DeviceUid,
    ) -> Result<bool, StorageError> {
        let mut contact = Self::load(txn, &owned_identity, &contact_identity)?.unwrap_or(Self {
            owned_identity,
            contact_identity,
            devices: BTreeSet::new(),
        });

        let added = contact.devices.insert(device);
        if added {
            contact.save(txn)?;
        }
        Ok(added)
    }

    /// Replace the device list of a contact.
    pub fn replace_devices(
        txn: &mut Transaction<'_>,
        owned_identity: IdentityId,
        contact_identity: IdentityId,
        devices: impl IntoIterator<Item = DeviceUid>,
    ) -> Result<(), StorageError> {
        Self { owned_identity, contact_identity, devices: devices.into_iter().collect() }.save(txn)
    }

    /// Persist this contact.
    pub fn save(&self, txn: &mut Transaction<'_>) -> Result<(), StorageError> {
        txn.put(Table::Contacts, Self::key(&self.owned_identity, &self.contact_identity), self)
    }
}

#[cfg(test)]
mod tests {
    use keyloom_crypto::SeededPrng;

    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn identity_is_public_key() {
        let mut prng = SeededPrng::from_u64(1);
        let owned = OwnedIdentity::generate(&mut prng);
        assert_eq!(owned.identity.as_bytes(), &owned.key_pair().public_key());
    }

    #[test]
    fn identity_survives_storage() {
        let storage = MemoryStorage::new();
        let mut prng = SeededPrng::from_u64(2);
        let owned = OwnedIdentity::generate(&mut prng);

        let mut txn = Transaction::begin(&storage);
        owned.save(&mut txn).unwrap();
        txn.commit().unwrap();

        let txn = Transaction::begin(&storage);
        let loaded = OwnedIdentity::load(&txn, &owned.identity).unwrap().unwrap();
        assert_eq!(loaded.current_device, owned.current_device);
        assert_eq!(loaded.key_pair().public_key(), owned.key_pair().public_key());
    }

    #[test]
    fn add_device_is_idempotent() {
        let storage = MemoryStorage::new();
        let owned = IdentityId::from_bytes([1; 32]);
        let contact = IdentityId::from_bytes([2; 32]);
        let device = DeviceUid::from_bytes([3; 32]);

        let mut txn = Transaction::begin(&storage);
        assert!(Contact::add_device(&mut txn, owned, contact, device).unwrap());
        assert!(!Contact::add_device(&mut txn, owned, contact, device).unwrap());

        let loaded = Contact::load(&txn, &owned, &contact).unwrap().unwrap();
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(Contact::load_for_identity(&txn, &owned).unwrap().len(), 1);
    }
}
