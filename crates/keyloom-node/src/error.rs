//! Node error types.

use keyloom_core::{EngineError, StorageError};
use keyloom_proto::{DeviceUid, IdentityId};
use thiserror::Error;

/// Errors that can occur in the node runtime.
#[derive(Error, Debug)]
pub enum NodeError {
    /// The engine rejected or failed an operation.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Opening or using a storage backend failed outside the engine.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// No mailbox is registered for the destination device.
    #[error("no route to device {device} of {identity}")]
    Unreachable {
        /// Destination identity
        identity: IdentityId,
        /// Destination device
        device: DeviceUid,
    },

    /// Transport failure (closed mailbox, dropped connection).
    #[error("transport error: {0}")]
    Transport(String),

    /// A flow task panicked or was aborted.
    #[error("flow error: {0}")]
    Flow(String),
}

impl NodeError {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Engine(err) => err.is_transient(),
            Self::Storage(err) => err.is_transient(),
            Self::Unreachable { .. } | Self::Transport(_) => true,
            Self::Flow(_) => false,
        }
    }
}
