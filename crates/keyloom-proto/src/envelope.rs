//! Wire envelopes exchanged with the transport.
//!
//! The engine never talks to the network. It emits [`Envelope`]s (device to
//! device) and [`ServerQuery`]s (device to server); the transport delivers
//! them and feeds received envelopes and query responses back in.

use keyloom_crypto::KeyId;
use serde::{Deserialize, Serialize};

use crate::{
    codec,
    error::Result,
    ids::{DeviceUid, IdentityId, InstanceUid},
    message::{MessageKind, ProtocolId, ProtocolMessage},
    reception::ReceptionChannel,
};

/// Device-to-device envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending identity
    pub from_identity: IdentityId,
    /// Sending device
    pub from_device: DeviceUid,
    /// Receiving identity
    pub to_identity: IdentityId,
    /// Receiving device
    pub to_device: DeviceUid,
    /// Encrypted content
    pub body: EnvelopeBody,
}

/// Encrypted content of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeBody {
    /// Encrypted under a single-use channel key
    Channel {
        /// Which key of the receiver's provisions decrypts this unit
        key_id: KeyId,
        /// `nonce || ciphertext || tag`
        ciphertext: Vec<u8>,
    },

    /// Sealed to the receiver's identity key (bootstrap)
    Sealed {
        /// `ephemeral public key || ciphertext`
        sealed: Vec<u8>,
    },
}

impl Envelope {
    /// Encode for the transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(self)
    }

    /// Decode from the transport.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::decode(bytes)
    }
}

/// Query sent to the server on behalf of a protocol instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerQuery {
    /// Identity the query is made for
    pub owned_identity: IdentityId,
    /// Protocol waiting for the response
    pub protocol: ProtocolId,
    /// Instance waiting for the response
    pub instance_uid: InstanceUid,
    /// Message kind the response must be delivered as
    pub response_kind: MessageKind,
    /// What is being asked
    pub query: QueryKind,
}

/// Supported server queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    /// List the devices registered for an identity
    DeviceDiscovery {
        /// Identity to look up
        identity: IdentityId,
    },
}

/// Server answers to [`QueryKind`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryResponse {
    /// Devices registered for the queried identity
    DeviceDiscovery {
        /// Device list
        devices: Vec<DeviceUid>,
    },
}

impl ServerQuery {
    /// Build the protocol message that delivers `response` back to the
    /// waiting instance.
    pub fn respond(&self, response: &QueryResponse) -> Result<ProtocolMessage> {
        Ok(ProtocolMessage {
            owned_identity: self.owned_identity,
            protocol: self.protocol,
            instance_uid: self.instance_uid,
            kind: self.response_kind,
            body: codec::encode(response)?,
            reception: ReceptionChannel::ServerResponse,
        })
    }
}
