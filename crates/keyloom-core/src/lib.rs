//! Keyloom engine core.
//!
//! Sans-IO implementation of the Keyloom messaging engine: single-use key
//! provisioning for device-to-device channels, and a generic dispatcher that
//! drives multi-step protocols (channel creation, full ratchet, device
//! discovery) from incoming messages.
//!
//! # Architecture
//!
//! Nothing in this crate performs I/O. Every operation takes a
//! [`storage::Transaction`] over an injected [`Storage`] backend and returns
//! [`EngineAction`]s describing what the caller should do once the
//! transaction has committed (send an envelope, query the server, feed a
//! message back, notify the application). The runtime crate executes them.
//!
//! # Components
//!
//! - [`ledger`]: key material and provisions (ratchet epochs)
//! - [`channel`]: per-device channels, encryption and full ratchets
//! - [`protocol`]: catalog, instances and the step dispatcher
//! - [`Engine`]: facade that owns storage, environment and catalog
//!
//! # Invariants
//!
//! - A key material is consumed at most once
//! - An active provision holds at least `reprovisioning_threshold`
//!   non-expiring receive keys after every ratchet check
//! - A step's state change, collaborator writes and inbox removal commit
//!   together or not at all

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod action;
pub mod channel;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod identity;
pub mod inbox;
pub mod ledger;
pub mod protocol;
pub mod storage;

pub use action::{EngineAction, Notification};
pub use channel::{Channel, ChannelId};
pub use config::EngineConfig;
pub use engine::{Engine, MaintenanceReport};
pub use env::{EntropyPrng, Environment, SimEnv};
pub use error::{ChannelError, EngineError, LedgerError};
pub use identity::{Contact, OwnedIdentity};
pub use inbox::InboxEntry;
pub use protocol::{
    CancelReason, Catalog, CatalogError, DiscardReason, Dispatch, DispatchOutcome,
    InstanceRecord, StateId, StepError,
};
pub use storage::{MemoryStorage, Storage, StorageError, Table, Transaction, WriteBatch, WriteOp};
