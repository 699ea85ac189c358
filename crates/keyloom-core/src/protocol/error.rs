//! Protocol catalog and step errors.

use keyloom_crypto::CryptoError;
use keyloom_proto::{MessageKind, ProtocolError, ProtocolId};
use thiserror::Error;

use super::StateId;
use crate::{error::ChannelError, storage::StorageError};

/// Catalog-authoring defects, reported at registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Two protocols registered under one id
    #[error("protocol {0:?} registered twice")]
    DuplicateProtocol(ProtocolId),

    /// Two steps accept the same (state, message) pair
    #[error("protocol {protocol:?}: several steps for state {state:?} and message {message:?}")]
    AmbiguousStep {
        /// Offending protocol
        protocol: ProtocolId,
        /// Shared start state
        state: StateId,
        /// Shared message kind
        message: MessageKind,
    },

    /// A step starts from the terminal Cancelled state
    #[error("protocol {protocol:?}: step for message {message:?} starts from Cancelled")]
    StepFromCancelled {
        /// Offending protocol
        protocol: ProtocolId,
        /// Message kind of the step
        message: MessageKind,
    },
}

/// Failure of one step execution.
///
/// `Violation` cancels the instance. `NotApplicable` discards the message.
/// Every other variant is a collaborator failure: the attempt is dropped
/// without any mutation and the error reaches the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Security check failed (bad confirmation, unexpected sender, counter
    /// mismatch)
    #[error("protocol violation: {0}")]
    Violation(String),

    /// The state or message does not have the shape this step expects
    #[error("step does not apply")]
    NotApplicable,

    /// Channel failure
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Crypto primitive failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Encoding of an outbound message failed
    #[error("encoding error: {0}")]
    Encoding(#[from] ProtocolError),

    /// Storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StepError {
    /// Shorthand for a violation with a message.
    pub fn violation(reason: impl Into<String>) -> Self {
        Self::Violation(reason.into())
    }

    /// Returns true if retrying the step may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Channel(err) => err.is_transient(),
            Self::Storage(err) => err.is_transient(),
            Self::Violation(_) | Self::NotApplicable | Self::Crypto(_) | Self::Encoding(_) => {
                false
            },
        }
    }
}
