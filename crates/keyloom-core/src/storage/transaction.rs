//! Unit of work over a [`Storage`] backend.
//!
//! Every ledger, channel and protocol operation takes a `&mut Transaction`.
//! Writes are buffered and visible to later reads through the same
//! transaction; nothing reaches the backend until [`Transaction::commit`].
//! Dropping a transaction discards it.

use std::collections::BTreeMap;

use serde::{Serialize, de::DeserializeOwned};

use super::{Storage, StorageError, Table, WriteBatch};

type PendingWrites = BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>;

/// Buffered read-your-writes transaction.
pub struct Transaction<'s> {
    storage: &'s dyn Storage,
    /// `None` marks a pending delete
    pending: PendingWrites,
}

/// Saved position of a [`Transaction`], used to drop a failed step's writes
/// while keeping everything buffered before it.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pending: PendingWrites,
}

impl<'s> Transaction<'s> {
    /// Start a transaction over `storage`.
    pub fn begin(storage: &'s dyn Storage) -> Self {
        Self { storage, pending: BTreeMap::new() }
    }

    /// Raw point read, pending writes first.
    pub fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        match self.pending.get(&(table, key.to_vec())) {
            Some(pending) => Ok(pending.clone()),
            None => self.storage.get(table, key),
        }
    }

    /// Raw prefix scan merged with pending writes, in key order.
    pub fn scan_raw(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> =
            self.storage.scan_prefix(table, prefix)?.into_iter().collect();

        let overlay = self
            .pending
            .range((table, prefix.to_vec())..)
            .take_while(|((t, key), _)| *t == table && key.starts_with(prefix));

        for ((_, key), value) in overlay {
            match value {
                Some(value) => {
                    rows.insert(key.clone(), value.clone());
                },
                None => {
                    rows.remove(key);
                },
            }
        }

        Ok(rows.into_iter().collect())
    }

    /// Buffer a raw put.
    pub fn put_raw(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.pending.insert((table, key), Some(value));
    }

    /// Buffer a delete.
    pub fn delete(&mut self, table: Table, key: &[u8]) {
        self.pending.insert((table, key.to_vec()), None);
    }

    /// Typed point read.
    ///
    /// # Errors
    ///
    /// - `Serialization` if the stored bytes do not decode as `T`
    pub fn get<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        self.get_raw(table, key)?
            .map(|bytes| keyloom_proto::decode(&bytes).map_err(StorageError::from))
            .transpose()
    }

    /// Typed put.
    pub fn put<T: Serialize>(
        &mut self,
        table: Table,
        key: Vec<u8>,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = keyloom_proto::encode(value)?;
        self.put_raw(table, key, bytes);
        Ok(())
    }

    /// Typed prefix scan.
    pub fn scan<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>, StorageError> {
        self.scan_raw(table, prefix)?
            .into_iter()
            .map(|(key, bytes)| -> Result<_, StorageError> {
                Ok((key, keyloom_proto::decode(&bytes)?))
            })
            .collect()
    }

    /// Remember the current set of buffered writes.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint { pending: self.pending.clone() }
    }

    /// Forget every write buffered since `checkpoint`.
    pub fn rollback_to(&mut self, checkpoint: Checkpoint) {
        self.pending = checkpoint.pending;
    }

    /// Number of distinct keys written so far.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Turn the buffered writes into a batch without committing.
    pub fn into_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for ((table, key), value) in self.pending {
            match value {
                Some(value) => batch.put(table, key, value),
                None => batch.delete(table, key),
            }
        }
        batch
    }

    /// Apply every buffered write atomically.
    ///
    /// # Errors
    ///
    /// Whatever the backend reports. On error nothing was applied.
    pub fn commit(self) -> Result<(), StorageError> {
        let storage = self.storage;
        let batch = self.into_batch();
        if batch.is_empty() {
            return Ok(());
        }
        storage.commit(batch)
    }
}
