//! Protocol messages.
//!
//! A [`WireProtocolMessage`] is what travels (encrypted) between devices. Once
//! it reaches an engine it is tagged with the owning identity and the
//! reception channel it came through, becoming a [`ProtocolMessage`].

use serde::{Deserialize, Serialize};

use crate::{
    codec,
    error::Result,
    ids::{IdentityId, InstanceUid},
    reception::ReceptionChannel,
};

/// Identifier of a cataloged protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolId(pub u16);

/// Raw message kind within a protocol's message catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKind(pub u16);

/// Protocol message as sent between devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireProtocolMessage {
    /// Target protocol
    pub protocol: ProtocolId,
    /// Target protocol instance
    pub instance_uid: InstanceUid,
    /// Message kind within the protocol
    pub kind: MessageKind,
    /// CBOR-encoded message body, opaque to the engine
    pub body: Vec<u8>,
}

impl WireProtocolMessage {
    /// Encode for encryption.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(self)
    }

    /// Decode after decryption.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::decode(bytes)
    }

    /// Attach the receiving identity and reception channel.
    pub fn into_received(
        self,
        owned_identity: IdentityId,
        reception: ReceptionChannel,
    ) -> ProtocolMessage {
        ProtocolMessage {
            owned_identity,
            protocol: self.protocol,
            instance_uid: self.instance_uid,
            kind: self.kind,
            body: self.body,
            reception,
        }
    }
}

/// Protocol message addressed to a local identity, with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Local identity the message is for
    pub owned_identity: IdentityId,
    /// Target protocol
    pub protocol: ProtocolId,
    /// Target protocol instance
    pub instance_uid: InstanceUid,
    /// Message kind within the protocol
    pub kind: MessageKind,
    /// CBOR-encoded message body
    pub body: Vec<u8>,
    /// How the message arrived
    pub reception: ReceptionChannel,
}

impl ProtocolMessage {
    /// Strip provenance for sending.
    pub fn to_wire(&self) -> WireProtocolMessage {
        WireProtocolMessage {
            protocol: self.protocol,
            instance_uid: self.instance_uid,
            kind: self.kind,
            body: self.body.clone(),
        }
    }
}
