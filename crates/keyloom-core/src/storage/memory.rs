#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use super::{Storage, StorageError, Table, WriteBatch, WriteOp};

/// In-memory storage implementation for testing and simulation
///
/// One `BTreeMap` per table, so prefix scans come back in key order like a
/// real ordered store. All state is wrapped in `Arc<Mutex<>>`; a batch is
/// applied under a single lock acquisition, which makes commits atomic.
/// Uses `lock().expect()` which will panic if the mutex is poisoned -
/// acceptable for test code.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a table.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock). This is acceptable for test/simulation code.
    #[allow(clippy::expect_used)]
    pub fn len(&self, table: Table) -> usize {
        self.inner.lock().expect("Mutex poisoned").get(&table).map_or(0, BTreeMap::len)
    }

    /// True if no table holds any record.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("Mutex poisoned").values().all(BTreeMap::is_empty)
    }

    /// Copy of every table, for before/after comparisons in tests.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn snapshot(&self) -> BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.iter().filter(|(_, rows)| !rows.is_empty()).map(|(t, r)| (*t, r.clone())).collect()
    }
}

impl Storage for MemoryStorage {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        let Some(rows) = inner.get(&table) else {
            return Ok(Vec::new());
        };

        Ok(rows
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        for op in batch {
            match op {
                WriteOp::Put { table, key, value } => {
                    inner.entry(table).or_default().insert(key, value);
                },
                WriteOp::Delete { table, key } => {
                    if let Some(rows) = inner.get_mut(&table) {
                        rows.remove(&key);
                    }
                },
            }
        }

        Ok(())
    }
}
