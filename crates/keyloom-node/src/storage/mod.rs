//! Storage backends for the node.
//!
//! The engine's [`keyloom_core::Storage`] trait plus two implementations that
//! only make sense with a real runtime: a durable redb database and a
//! fault-injecting wrapper for chaos tests.

mod chaotic;
mod redb;

pub use chaotic::ChaoticStorage;
pub use keyloom_core::{MemoryStorage, Storage, StorageError};
pub use self::redb::RedbStorage;
