//! Keyloom Protocol Types
//!
//! Identifiers, reception-channel descriptors, protocol messages and wire
//! envelopes shared by the engine and its transport collaborators.
//!
//! All structured values cross the wire (and land in storage) as CBOR through
//! [`codec`]. The engine treats message bodies and protocol states as opaque
//! bytes; only the protocol that owns them decodes them.
//!
//! # Invariants
//!
//! - Every decode is size-checked before the CBOR parser runs
//! - Round-trip encoding produces an equal value

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod message;
pub mod reception;

pub use codec::{MAX_ENCODED_SIZE, decode, encode};
pub use envelope::{Envelope, EnvelopeBody, QueryKind, QueryResponse, ServerQuery};
pub use error::{ProtocolError, Result};
pub use ids::{DeviceUid, IdentityId, InstanceUid, MessageUid};
pub use message::{MessageKind, ProtocolId, ProtocolMessage, WireProtocolMessage};
pub use reception::{ReceptionChannel, ReceptionKind};
