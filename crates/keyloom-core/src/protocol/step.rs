//! The contract between protocols and the dispatcher.

use std::fmt;

use keyloom_crypto::{Prng, seal};
use keyloom_proto::{
    DeviceUid, Envelope, EnvelopeBody, IdentityId, InstanceUid, MessageKind, ProtocolError,
    ProtocolId, QueryKind, ReceptionChannel, ReceptionKind, ServerQuery, WireProtocolMessage,
};
use serde::{Serialize, de::DeserializeOwned};

use super::{StateId, StepError};
use crate::{
    action::{EngineAction, Notification},
    channel::{Channel, ChannelId},
    config::EngineConfig,
    identity::OwnedIdentity,
    storage::Transaction,
};

/// State set of a protocol.
///
/// States are persisted as CBOR between steps, so they carry every value a
/// later step needs (remote endpoint, ephemeral keys, expected tags).
pub trait ProtocolState: Serialize + DeserializeOwned + Clone + fmt::Debug {
    /// Catalog id of this state.
    fn id(&self) -> StateId;

    /// State of a fresh instance.
    fn initial() -> Self;

    /// State written when the instance is cancelled.
    fn cancelled() -> Self;

    /// True if no step may leave this state.
    fn is_terminal(&self) -> bool;
}

/// Message set of a protocol.
pub trait ProtocolMessageSet: Sized + fmt::Debug {
    /// Catalog kind of this message.
    fn kind(&self) -> MessageKind;

    /// Encode the message body (without the kind).
    fn encode_body(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Decode a body of the given kind.
    ///
    /// # Errors
    ///
    /// - `UnknownMessageKind` if `kind` is not part of the set
    /// - `CborDecode` if the body does not match the kind
    fn decode(kind: MessageKind, body: &[u8]) -> Result<Self, ProtocolError>;
}

/// One row of a protocol's step table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDescriptor<S> {
    /// Step to run
    pub step: S,
    /// State the instance must be in
    pub from: StateId,
    /// Message kind that triggers the step
    pub message: MessageKind,
    /// Reception kind the message must have arrived through
    pub reception: ReceptionKind,
}

/// A cataloged protocol.
pub trait Protocol: Send + Sync + 'static {
    /// Catalog id.
    const ID: ProtocolId;

    /// Human readable name, used in logs.
    const NAME: &'static str;

    /// State set.
    type State: ProtocolState;

    /// Message set.
    type Message: ProtocolMessageSet;

    /// Step identifiers.
    type Step: Copy + fmt::Debug + Send + Sync + 'static;

    /// Static step table.
    fn steps() -> &'static [StepDescriptor<Self::Step>];

    /// Run one step.
    ///
    /// Return `Ok(Some(next))` to move the instance, `Ok(None)` to leave it
    /// where it is. Every write goes through `ctx`; returning
    /// [`StepError::Violation`] drops them all and cancels the instance.
    fn execute(
        &self,
        step: Self::Step,
        state: Self::State,
        message: Self::Message,
        ctx: &mut StepContext<'_, '_>,
    ) -> Result<Option<Self::State>, StepError>;
}

/// Where a step posts a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Back into this engine for the same owned identity
    Local,
    /// Encrypted over an existing channel
    Direct(ChannelId),
    /// Encrypted over every confirmed channel to another device of the
    /// owned identity
    AllOwnedDevices,
    /// Sealed to an identity key (no channel needed)
    Asymmetric {
        /// Receiving identity
        remote_identity: IdentityId,
        /// Receiving device
        remote_device: DeviceUid,
    },
}

/// Everything a running step may touch.
///
/// Writes go to the dispatcher's transaction. Outbound messages and
/// notifications are collected as [`EngineAction`]s and released only if the
/// step's transaction commits.
pub struct StepContext<'a, 's> {
    txn: &'a mut Transaction<'s>,
    prng: &'a mut dyn Prng,
    config: &'a EngineConfig,
    now: u64,
    owned: &'a OwnedIdentity,
    protocol: ProtocolId,
    instance_uid: InstanceUid,
    reception: ReceptionChannel,
    actions: Vec<EngineAction>,
}

impl<'a, 's> StepContext<'a, 's> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        txn: &'a mut Transaction<'s>,
        prng: &'a mut dyn Prng,
        config: &'a EngineConfig,
        now: u64,
        owned: &'a OwnedIdentity,
        protocol: ProtocolId,
        instance_uid: InstanceUid,
        reception: ReceptionChannel,
    ) -> Self {
        Self {
            txn,
            prng,
            config,
            now,
            owned,
            protocol,
            instance_uid,
            reception,
            actions: Vec::new(),
        }
    }

    /// The step's transaction.
    pub fn txn(&mut self) -> &mut Transaction<'s> {
        self.txn
    }

    /// Randomness for ephemeral keys.
    pub fn prng(&mut self) -> &mut dyn Prng {
        &mut *self.prng
    }

    /// Engine configuration.
    pub fn config(&self) -> &'a EngineConfig {
        self.config
    }

    /// Wall clock, Unix seconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Identity the instance runs for.
    pub fn owned(&self) -> &'a OwnedIdentity {
        self.owned
    }

    /// Running instance.
    pub fn instance_uid(&self) -> InstanceUid {
        self.instance_uid
    }

    /// How the triggering message arrived.
    pub fn reception(&self) -> ReceptionChannel {
        self.reception
    }

    /// Channel from this identity to a remote device.
    pub fn channel_id(&self, remote_identity: IdentityId, remote_device: DeviceUid) -> ChannelId {
        ChannelId { owned_identity: self.owned.identity, remote_identity, remote_device }
    }

    /// Post a message of this protocol to the same instance uid elsewhere.
    ///
    /// Direct posts encrypt inside the step's transaction, so the send key
    /// is only consumed if the step commits.
    pub fn post<M: ProtocolMessageSet>(
        &mut self,
        destination: Destination,
        message: &M,
    ) -> Result<(), StepError> {
        let wire = WireProtocolMessage {
            protocol: self.protocol,
            instance_uid: self.instance_uid,
            kind: message.kind(),
            body: message.encode_body()?,
        };

        match destination {
            Destination::Local => {
                let received = wire.into_received(self.owned.identity, ReceptionChannel::Local);
                self.actions.push(EngineAction::Loopback(received));
            },
            Destination::Direct(channel_id) => self.post_direct(channel_id, &wire)?,
            Destination::AllOwnedDevices => {
                let owned_channels = Channel::load_for_identity(self.txn, &self.owned.identity)?
                    .into_iter()
                    .filter(|channel| {
                        channel.confirmed && channel.id.remote_identity == self.owned.identity
                    })
                    .map(|channel| channel.id)
                    .collect::<Vec<_>>();
                for channel_id in owned_channels {
                    self.post_direct(channel_id, &wire)?;
                }
            },
            Destination::Asymmetric { remote_identity, remote_device } => {
                let sealed =
                    seal(remote_identity.as_bytes(), &wire.to_bytes()?, &mut *self.prng)?;
                self.actions.push(EngineAction::Send(Envelope {
                    from_identity: self.owned.identity,
                    from_device: self.owned.current_device,
                    to_identity: remote_identity,
                    to_device: remote_device,
                    body: EnvelopeBody::Sealed { sealed },
                }));
            },
        }
        Ok(())
    }

    fn post_direct(
        &mut self,
        channel_id: ChannelId,
        wire: &WireProtocolMessage,
    ) -> Result<(), StepError> {
        let channel = Channel::require(self.txn, &channel_id)?;
        let (key_id, ciphertext) =
            channel.encrypt(self.txn, &wire.to_bytes()?, &mut *self.prng, self.config)?;

        self.actions.push(EngineAction::Send(Envelope {
            from_identity: self.owned.identity,
            from_device: channel.current_device,
            to_identity: channel_id.remote_identity,
            to_device: channel_id.remote_device,
            body: EnvelopeBody::Channel { key_id, ciphertext },
        }));
        Ok(())
    }

    /// Ask the server something. The answer is delivered to this instance
    /// as a `ServerResponse` message of kind `response_kind`.
    pub fn query_server(&mut self, query: QueryKind, response_kind: MessageKind) {
        self.actions.push(EngineAction::Query(ServerQuery {
            owned_identity: self.owned.identity,
            protocol: self.protocol,
            instance_uid: self.instance_uid,
            response_kind,
            query,
        }));
    }

    /// Tell the application something.
    pub fn notify(&mut self, notification: Notification) {
        self.actions.push(EngineAction::Notify(notification));
    }

    pub(crate) fn into_actions(self) -> Vec<EngineAction> {
        self.actions
    }
}
