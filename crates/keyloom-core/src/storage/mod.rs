//! Storage abstraction for the engine
//!
//! The engine persists everything (identities, channels, provisions, key
//! material, protocol instances, contacts, inbox) in a small set of ordered
//! key-value tables. Backends only need point reads, prefix scans and an
//! atomic batch commit; typed access and read-your-writes live in
//! [`Transaction`].
//!
//! The trait is synchronous (no async) to keep the engine Sans-IO.

mod error;
mod memory;
mod transaction;

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use transaction::{Checkpoint, Transaction};

/// Logical tables.
///
/// Every backend must keep keys of a table in byte order so prefix scans
/// return records grouped by owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Owned identities and their key pairs. Key: identity
    Identities,
    /// Channel records. Key: owned || remote identity || remote device
    Channels,
    /// Provisions. Key: channel key || full ratchet count (BE)
    Provisions,
    /// Receive key material. Key: channel key || key id
    KeyMaterials,
    /// Protocol instances. Key: owned identity || instance uid
    Instances,
    /// Contact device lists. Key: owned identity || contact identity
    Contacts,
    /// Received, not yet processed protocol messages.
    /// Key: owned identity || received-at (BE) || message uid
    Inbox,
}

impl Table {
    /// All tables, in a fixed order.
    pub const ALL: [Table; 7] = [
        Table::Identities,
        Table::Channels,
        Table::Provisions,
        Table::KeyMaterials,
        Table::Instances,
        Table::Contacts,
        Table::Inbox,
    ];

    /// Stable table name used by durable backends.
    pub const fn name(self) -> &'static str {
        match self {
            Table::Identities => "identities",
            Table::Channels => "channels",
            Table::Provisions => "provisions",
            Table::KeyMaterials => "key_materials",
            Table::Instances => "instances",
            Table::Contacts => "contacts",
            Table::Inbox => "inbox",
        }
    }
}

/// One write of a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a value
    Put {
        /// Target table
        table: Table,
        /// Record key
        key: Vec<u8>,
        /// Encoded record
        value: Vec<u8>,
    },
    /// Remove a key (no-op if absent)
    Delete {
        /// Target table
        table: Table,
        /// Record key
        key: Vec<u8>,
    },
}

/// Ordered set of writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put.
    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put { table, key, value });
    }

    /// Queue a delete.
    pub fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { table, key });
    }

    /// Queued writes, in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type IntoIter = std::vec::IntoIter<WriteOp>;
    type Item = WriteOp;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Storage backend.
///
/// Must be Send + Sync (shared between lanes). Implementations typically
/// share internal state via Arc so clones access the same underlying storage.
/// The trait is object safe: transactions hold a `&dyn Storage`.
///
/// # Invariants
///
/// - `commit` applies every write of the batch or none of them
/// - A committed batch is durable when `commit` returns `Ok`
/// - `scan_prefix` returns entries in ascending key order
pub trait Storage: Send + Sync {
    /// Point read.
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply a batch atomically.
    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;
}
