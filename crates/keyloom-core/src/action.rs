//! Post-commit effects.
//!
//! Steps never touch the network or the UI. Everything they want to happen
//! outside the engine is returned as an [`EngineAction`] and released to the
//! caller only after the step's transaction has committed.

use keyloom_proto::{
    DeviceUid, Envelope, IdentityId, InstanceUid, ProtocolId, ProtocolMessage, ServerQuery,
};

use crate::{channel::ChannelId, protocol::CancelReason};

/// Effect for the runtime to execute after commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Deliver an envelope to another device
    Send(Envelope),

    /// Send a query to the server; the answer comes back as a
    /// `ServerResponse` protocol message
    Query(ServerQuery),

    /// Feed a message back into this engine
    Loopback(ProtocolMessage),

    /// Tell the application something happened
    Notify(Notification),
}

/// Application-facing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A channel handshake completed
    ChannelConfirmed {
        /// Channel that became usable
        channel: ChannelId,
    },

    /// A full ratchet completed and the new epoch encrypts
    FullRatchetCompleted {
        /// Rekeyed channel
        channel: ChannelId,
        /// New active epoch
        full_ratchet_count: u64,
    },

    /// The device list of an identity was refreshed
    DevicesDiscovered {
        /// Local identity that asked
        owned_identity: IdentityId,
        /// Identity whose devices were listed
        identity: IdentityId,
        /// Devices now on record
        devices: Vec<DeviceUid>,
    },

    /// A protocol instance was cancelled
    InstanceCancelled {
        /// Local identity owning the instance
        owned_identity: IdentityId,
        /// Protocol of the instance
        protocol: ProtocolId,
        /// Cancelled instance
        instance_uid: InstanceUid,
        /// Why it was cancelled
        reason: CancelReason,
    },
}
