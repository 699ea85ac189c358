//! Persisted protocol instances.

use keyloom_proto::{IdentityId, InstanceUid, ProtocolId};
use serde::{Deserialize, Serialize};

use super::StateId;
use crate::storage::{StorageError, Table, Transaction};

/// One running (or finished) protocol instance.
///
/// Terminal instances stay in storage as tombstones so a late message for
/// the same uid is discarded instead of starting the protocol over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Identity the instance runs for
    pub owned_identity: IdentityId,
    /// Instance uid, shared by every participant
    pub instance_uid: InstanceUid,
    /// Protocol the instance runs
    pub protocol: ProtocolId,
    /// Current state id
    pub state_id: StateId,
    /// Encoded current state
    pub state: Vec<u8>,
    /// No step may run any more
    pub terminal: bool,
    /// Wall clock of the last transition, Unix seconds
    pub updated_at: u64,
}

impl InstanceRecord {
    fn key(owned_identity: &IdentityId, instance_uid: &InstanceUid) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(owned_identity.as_bytes());
        key.extend_from_slice(instance_uid.as_bytes());
        key
    }

    /// Load an instance.
    pub fn load(
        txn: &Transaction<'_>,
        owned_identity: &IdentityId,
        instance_uid: &InstanceUid,
    ) -> Result<Option<Self>, StorageError> {
        txn.get(Table::Instances, &Self::key(owned_identity, instance_uid))
    }

    /// Every instance of an owned identity.
    pub fn load_for_identity(
        txn: &Transaction<'_>,
        owned_identity: &IdentityId,
    ) -> Result<Vec<Self>, StorageError> {
        Ok(txn
            .scan(Table::Instances, owned_identity.as_bytes())?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Persist the instance.
    pub fn save(&self, txn: &mut Transaction<'_>) -> Result<(), StorageError> {
        txn.put(Table::Instances, Self::key(&self.owned_identity, &self.instance_uid), self)
    }

    /// True if the instance was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state_id == StateId::CANCELLED
    }
}
