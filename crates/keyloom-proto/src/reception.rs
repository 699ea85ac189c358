//! Reception-channel descriptors.
//!
//! Every protocol message carries a description of how it reached the
//! engine. Protocol steps declare the [`ReceptionKind`] they accept; a message
//! arriving through any other kind is a protocol violation.

use serde::{Deserialize, Serialize};

use crate::ids::{DeviceUid, IdentityId};

/// How a protocol message arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceptionChannel {
    /// Posted by the local engine or application (loopback)
    Local,

    /// Decrypted from a confirmed or pending direct channel
    Direct {
        /// Identity on the other end of the channel
        remote_identity: IdentityId,
        /// Device on the other end of the channel
        remote_device: DeviceUid,
    },

    /// Opened from a sealed box addressed to our identity key
    Asymmetric {
        /// Identity claimed by the sender
        remote_identity: IdentityId,
        /// Device claimed by the sender
        remote_device: DeviceUid,
    },

    /// Response to a query this engine sent to the server
    ServerResponse,
}

impl ReceptionChannel {
    /// Kind of this descriptor, used for step matching.
    pub fn kind(&self) -> ReceptionKind {
        match self {
            Self::Local => ReceptionKind::Local,
            Self::Direct { .. } => ReceptionKind::Direct,
            Self::Asymmetric { .. } => ReceptionKind::Asymmetric,
            Self::ServerResponse => ReceptionKind::ServerResponse,
        }
    }

    /// Remote endpoint, if the message came from another device.
    pub fn remote(&self) -> Option<(IdentityId, DeviceUid)> {
        match self {
            Self::Direct { remote_identity, remote_device }
            | Self::Asymmetric { remote_identity, remote_device } => {
                Some((*remote_identity, *remote_device))
            },
            Self::Local | Self::ServerResponse => None,
        }
    }
}

/// Kind of reception channel a protocol step expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceptionKind {
    /// Local loopback
    Local,
    /// Direct device channel
    Direct,
    /// Asymmetric bootstrap channel
    Asymmetric,
    /// Server query response
    ServerResponse,
}
