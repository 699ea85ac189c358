//! Received protocol messages awaiting their step.
//!
//! A message is written here before it is dispatched. The dispatch
//! transaction deletes it, so a crash between receipt and commit leaves the
//! message in the inbox for [`crate::Engine::replay_inbox`].

use keyloom_proto::{IdentityId, MessageUid, ProtocolMessage};
use serde::{Deserialize, Serialize};

use crate::storage::{StorageError, Table, Transaction};

/// One pending message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    /// Unique id of this receipt
    pub message_uid: MessageUid,
    /// Wall clock at receipt, Unix seconds
    pub received_at: u64,
    /// The message itself
    pub message: ProtocolMessage,
}

impl InboxEntry {
    /// `owned identity || received_at (BE) || message uid`, so a prefix scan
    /// returns an identity's messages in arrival order.
    fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(72);
        key.extend_from_slice(self.message.owned_identity.as_bytes());
        key.extend_from_slice(&self.received_at.to_be_bytes());
        key.extend_from_slice(self.message_uid.as_bytes());
        key
    }

    /// Persist the entry.
    pub fn save(&self, txn: &mut Transaction<'_>) -> Result<(), StorageError> {
        txn.put(Table::Inbox, self.key(), self)
    }

    /// Remove the entry.
    pub fn delete(&self, txn: &mut Transaction<'_>) {
        txn.delete(Table::Inbox, &self.key());
    }

    /// Pending entries of an identity, oldest first.
    pub fn load_for_identity(
        txn: &Transaction<'_>,
        owned_identity: &IdentityId,
    ) -> Result<Vec<Self>, StorageError> {
        Ok(txn
            .scan(Table::Inbox, owned_identity.as_bytes())?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }
}
