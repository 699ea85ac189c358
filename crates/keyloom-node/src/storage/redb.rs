//! Redb-backed durable storage implementation.
//!
//! Every logical [`Table`] maps to one redb table of raw byte keys and values.
//! A [`WriteBatch`] is applied inside a single redb write transaction, so a
//! crash mid-commit leaves either the whole batch or none of it on disk.

use std::{path::Path, sync::Arc};

use keyloom_core::{Storage, StorageError, Table, WriteBatch, WriteOp};
use redb::{Database, TableDefinition};

/// Table: identities
/// Key: identity [32 bytes]
/// Value: CBOR-encoded owned identity
const IDENTITIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("identities");

/// Table: channels
/// Key: owned identity || remote identity || remote device [96 bytes]
const CHANNELS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("channels");

/// Table: provisions
/// Key: channel key || full ratchet count (BE) [104 bytes]
const PROVISIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("provisions");

/// Table: key_materials
/// Key: channel key || key id
const KEY_MATERIALS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("key_materials");

/// Table: instances
/// Key: owned identity || instance uid [64 bytes]
const INSTANCES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("instances");

/// Table: contacts
/// Key: owned identity || contact identity [64 bytes]
const CONTACTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("contacts");

/// Table: inbox
/// Key: owned identity || received-at (BE) || message uid [72 bytes]
const INBOX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("inbox");

fn definition(table: Table) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match table {
        Table::Identities => IDENTITIES,
        Table::Channels => CHANNELS,
        Table::Provisions => PROVISIONS,
        Table::KeyMaterials => KEY_MATERIALS,
        Table::Instances => INSTANCES,
        Table::Contacts => CONTACTS,
        Table::Inbox => INBOX,
    }
}

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates every table that does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        for table in Table::ALL {
            let _ = txn.open_table(definition(table)).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table =
            txn.open_table(definition(table)).map_err(|e| StorageError::Io(e.to_string()))?;

        let value = table.get(key).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table =
            txn.open_table(definition(table)).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut entries = Vec::new();
        for entry in table.range(prefix..).map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            entries.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(entries)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        // Dropping an uncommitted write transaction aborts it.
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        for op in batch {
            match op {
                WriteOp::Put { table, key, value } => {
                    let mut table = txn
                        .open_table(definition(table))
                        .map_err(|e| StorageError::Io(e.to_string()))?;
                    table
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(|e| StorageError::Io(e.to_string()))?;
                },
                WriteOp::Delete { table, key } => {
                    let mut table = txn
                        .open_table(definition(table))
                        .map_err(|e| StorageError::Io(e.to_string()))?;
                    table.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
                },
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn put(storage: &RedbStorage, table: Table, key: &[u8], value: &[u8]) {
        let mut batch = WriteBatch::new();
        batch.put(table, key.to_vec(), value.to_vec());
        storage.commit(batch).unwrap();
    }

    #[test]
    fn get_returns_committed_value() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("node.redb")).unwrap();

        put(&storage, Table::Channels, b"key", b"value");

        assert_eq!(storage.get(Table::Channels, b"key").unwrap(), Some(b"value".to_vec()));
        assert_eq!(storage.get(Table::Provisions, b"key").unwrap(), None);
    }

    #[test]
    fn scan_stops_at_prefix_boundary() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("node.redb")).unwrap();

        put(&storage, Table::Inbox, &[1, 9], b"b");
        put(&storage, Table::Inbox, &[1, 2], b"a");
        put(&storage, Table::Inbox, &[2, 0], b"c");
        put(&storage, Table::Inbox, &[0, 5], b"d");

        let entries = storage.scan_prefix(Table::Inbox, &[1]).unwrap();
        assert_eq!(entries, vec![(vec![1, 2], b"a".to_vec()), (vec![1, 9], b"b".to_vec())]);
    }

    #[test]
    fn batch_spans_tables() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("node.redb")).unwrap();
        put(&storage, Table::Inbox, b"message", b"pending");

        let mut batch = WriteBatch::new();
        batch.put(Table::Instances, b"instance".to_vec(), b"state".to_vec());
        batch.delete(Table::Inbox, b"message".to_vec());
        storage.commit(batch).unwrap();

        assert_eq!(storage.get(Table::Instances, b"instance").unwrap(), Some(b"state".to_vec()));
        assert_eq!(storage.get(Table::Inbox, b"message").unwrap(), None);
    }

    #[test]
    fn deleting_missing_key_is_noop() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("node.redb")).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete(Table::Contacts, b"absent".to_vec());
        storage.commit(batch).unwrap();

        assert!(storage.scan_prefix(Table::Contacts, b"").unwrap().is_empty());
    }
}
