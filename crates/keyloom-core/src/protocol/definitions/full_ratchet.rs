//! Full ratchet: re-key a confirmed channel from a fresh agreement.
//!
//! ```text
//! Alice                                        Bob
//!   │ Initiate (local)                           │
//!   │── AliceEphemeralKey { eA, p } (active) ───▶│ n = max(p, latest + 1)
//!   │                                            │ new epoch n, not active
//!   │◀── BobEphemeralKey { eB, n } (active) ─────│
//!   │ new epoch n, active                        │
//!   │── Ack { n } (epoch n) ────────────────────▶│ activate epoch n
//! ```
//!
//! Bob keeps encrypting with the old epoch until the Ack proves Alice holds
//! the new one. Units already in flight under the old epoch still decrypt
//! until the retired keys expire.
//!
//! Epoch numbers only move up and an epoch is never replaced. Bob answers
//! with the first number above everything he holds, so an exchange whose
//! reply was lost leaves an unused epoch behind and the next attempt skips
//! past it. If the Ack is lost, Bob switches as soon as a unit opens under
//! the new epoch.

use keyloom_crypto::{AgreementKeyPair, PUBLIC_KEY_SIZE};
use keyloom_proto::{
    DeviceUid, IdentityId, MessageKind, ProtocolError, ProtocolId, ReceptionKind, codec,
};
use serde::{Deserialize, Serialize};

use super::{require_sender, sender};
use crate::{
    action::Notification,
    channel::{Channel, ChannelId},
    protocol::{
        Destination, Protocol, ProtocolMessageSet, ProtocolState, StateId, StepContext,
        StepDescriptor, StepError,
    },
};

/// Local request to re-key a channel.
pub const INITIATE: MessageKind = MessageKind(0);
/// Alice's ephemeral key for the next epoch.
pub const ALICE_EPHEMERAL_KEY: MessageKind = MessageKind(1);
/// Bob's ephemeral key for the next epoch.
pub const BOB_EPHEMERAL_KEY: MessageKind = MessageKind(2);
/// Alice switched to the new epoch.
pub const ACK: MessageKind = MessageKind(3);

const ALICE_WAITING_FOR_K1: StateId = StateId(2);
const BOB_WAITING_FOR_ACK: StateId = StateId(3);
const FULL_RATCHET_DONE: StateId = StateId(4);

/// Full ratchet protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullRatchet;

/// Full ratchet states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FullRatchetState {
    /// Fresh instance
    Initial,
    /// Cancelled after a violation
    Cancelled,
    /// Alice sent `eA`
    AliceWaitingForK1 {
        /// Bob's identity
        remote_identity: IdentityId,
        /// Bob's device
        remote_device: DeviceUid,
        /// Alice's ephemeral key pair
        ephemeral: AgreementKeyPair,
        /// Epoch proposed; Bob may answer with a higher one
        full_ratchet_count: u64,
    },
    /// Bob created the new epoch and waits for Alice to switch
    BobWaitingForAck {
        /// Alice's identity
        remote_identity: IdentityId,
        /// Alice's device
        remote_device: DeviceUid,
        /// Epoch being created
        full_ratchet_count: u64,
    },
    /// The new epoch is active on this side
    FullRatchetDone {
        /// Active epoch
        full_ratchet_count: u64,
    },
}

impl ProtocolState for FullRatchetState {
    fn id(&self) -> StateId {
        match self {
            Self::Initial => StateId::INITIAL,
            Self::Cancelled => StateId::CANCELLED,
            Self::AliceWaitingForK1 { .. } => ALICE_WAITING_FOR_K1,
            Self::BobWaitingForAck { .. } => BOB_WAITING_FOR_ACK,
            Self::FullRatchetDone { .. } => FULL_RATCHET_DONE,
        }
    }

    fn initial() -> Self {
        Self::Initial
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::FullRatchetDone { .. })
    }
}

/// Full ratchet messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FullRatchetMessage {
    /// Re-key the channel to this device
    Initiate {
        /// Remote identity
        remote_identity: IdentityId,
        /// Remote device
        remote_device: DeviceUid,
    },
    /// `eA` and the epoch it is for
    AliceEphemeralKey {
        /// `eA`
        ephemeral_public: [u8; PUBLIC_KEY_SIZE],
        /// Epoch being created
        full_ratchet_count: u64,
    },
    /// `eB` and the epoch it is for
    BobEphemeralKey {
        /// `eB`
        ephemeral_public: [u8; PUBLIC_KEY_SIZE],
        /// Epoch being created
        full_ratchet_count: u64,
    },
    /// Alice encrypts with the new epoch
    Ack {
        /// Epoch now active on Alice's side
        full_ratchet_count: u64,
    },
}

impl ProtocolMessageSet for FullRatchetMessage {
    fn kind(&self) -> MessageKind {
        match self {
            Self::Initiate { .. } => INITIATE,
            Self::AliceEphemeralKey { .. } => ALICE_EPHEMERAL_KEY,
            Self::BobEphemeralKey { .. } => BOB_EPHEMERAL_KEY,
            Self::Ack { .. } => ACK,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        codec::encode(self)
    }

    fn decode(kind: MessageKind, body: &[u8]) -> Result<Self, ProtocolError> {
        let message: Self = codec::decode(body)?;
        if message.kind() != kind {
            return Err(ProtocolError::UnknownMessageKind {
                protocol: FullRatchet::ID.0,
                kind: kind.0,
            });
        }
        Ok(message)
    }
}

/// Full ratchet steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullRatchetStep {
    /// Alice: send `eA`
    SendEphemeralKey,
    /// Bob: create the epoch, answer with `eB`
    AnswerEphemeralKey,
    /// Alice: create and activate the epoch, acknowledge
    Activate,
    /// Bob: activate the epoch
    ReceiveAck,
}

const STEPS: &[StepDescriptor<FullRatchetStep>] = &[
    StepDescriptor {
        step: FullRatchetStep::SendEphemeralKey,
        from: StateId::INITIAL,
        message: INITIATE,
        reception: ReceptionKind::Local,
    },
    StepDescriptor {
        step: FullRatchetStep::AnswerEphemeralKey,
        from: StateId::INITIAL,
        message: ALICE_EPHEMERAL_KEY,
        reception: ReceptionKind::Direct,
    },
    StepDescriptor {
        step: FullRatchetStep::Activate,
        from: ALICE_WAITING_FOR_K1,
        message: BOB_EPHEMERAL_KEY,
        reception: ReceptionKind::Direct,
    },
    StepDescriptor {
        step: FullRatchetStep::ReceiveAck,
        from: BOB_WAITING_FOR_ACK,
        message: ACK,
        reception: ReceptionKind::Direct,
    },
];

impl Protocol for FullRatchet {
    const ID: ProtocolId = ProtocolId(2);
    const NAME: &'static str = "full-ratchet";

    type State = FullRatchetState;
    type Message = FullRatchetMessage;
    type Step = FullRatchetStep;

    fn steps() -> &'static [StepDescriptor<Self::Step>] {
        STEPS
    }

    fn execute(
        &self,
        step: Self::Step,
        state: Self::State,
        message: Self::Message,
        ctx: &mut StepContext<'_, '_>,
    ) -> Result<Option<Self::State>, StepError> {
        use FullRatchetMessage as M;
        use FullRatchetState as S;
        use FullRatchetStep as Step;

        let next = match (step, state, message) {
            (
                Step::SendEphemeralKey,
                S::Initial,
                M::Initiate { remote_identity, remote_device },
            ) => {
                let channel_id = ctx.channel_id(remote_identity, remote_device);
                send_ephemeral_key(ctx, channel_id)?
            },
            (
                Step::AnswerEphemeralKey,
                S::Initial,
                M::AliceEphemeralKey { ephemeral_public, full_ratchet_count },
            ) => answer_ephemeral_key(ctx, &ephemeral_public, full_ratchet_count)?,
            (
                Step::Activate,
                S::AliceWaitingForK1 {
                    remote_identity,
                    remote_device,
                    ephemeral,
                    full_ratchet_count,
                },
                M::BobEphemeralKey { ephemeral_public, full_ratchet_count: answered },
            ) => {
                require_sender(ctx, remote_identity, remote_device)?;
                let channel_id = ctx.channel_id(remote_identity, remote_device);
                activate(
                    ctx,
                    channel_id,
                    &ephemeral,
                    &ephemeral_public,
                    full_ratchet_count,
                    answered,
                )?
            },
            (
                Step::ReceiveAck,
                S::BobWaitingForAck { remote_identity, remote_device, full_ratchet_count },
                M::Ack { full_ratchet_count: acknowledged },
            ) => {
                require_sender(ctx, remote_identity, remote_device)?;
                require_count(full_ratchet_count, acknowledged)?;
                let channel_id = ctx.channel_id(remote_identity, remote_device);
                receive_ack(ctx, channel_id, full_ratchet_count)?
            },
            _ => return Err(StepError::NotApplicable),
        };
        Ok(Some(next))
    }
}

fn require_count(expected: u64, actual: u64) -> Result<(), StepError> {
    if expected != actual {
        return Err(StepError::violation(format!(
            "full ratchet count mismatch: expected {expected}, got {actual}"
        )));
    }
    Ok(())
}

/// Bob may raise the proposed epoch but never lower it, and the answer must
/// name an epoch this side does not hold yet.
fn require_answer(proposed: u64, answered: u64, channel: &Channel) -> Result<(), StepError> {
    if answered < proposed {
        return Err(StepError::violation(format!(
            "full ratchet answered epoch {answered} below proposed {proposed}"
        )));
    }
    if answered <= channel.latest_full_ratchet_count {
        return Err(StepError::violation(format!("epoch {answered} already exists")));
    }
    Ok(())
}

/// Load a channel the full ratchet can run on.
fn confirmed_channel(
    ctx: &mut StepContext<'_, '_>,
    channel_id: &ChannelId,
) -> Result<Channel, StepError> {
    match Channel::load(ctx.txn(), channel_id)? {
        Some(channel) if channel.confirmed => Ok(channel),
        Some(_) => Err(StepError::violation("channel is not confirmed")),
        None => Err(StepError::violation("no channel to re-key")),
    }
}

fn send_ephemeral_key(
    ctx: &mut StepContext<'_, '_>,
    channel_id: ChannelId,
) -> Result<FullRatchetState, StepError> {
    let channel = confirmed_channel(ctx, &channel_id)?;
    let full_ratchet_count = channel.next_full_ratchet_count();

    let ephemeral = AgreementKeyPair::generate(ctx.prng());
    ctx.post(
        Destination::Direct(channel_id),
        &FullRatchetMessage::AliceEphemeralKey {
            ephemeral_public: ephemeral.public_key(),
            full_ratchet_count,
        },
    )?;

    Ok(FullRatchetState::AliceWaitingForK1 {
        remote_identity: channel_id.remote_identity,
        remote_device: channel_id.remote_device,
        ephemeral,
        full_ratchet_count,
    })
}

fn answer_ephemeral_key(
    ctx: &mut StepContext<'_, '_>,
    alice_ephemeral: &[u8; PUBLIC_KEY_SIZE],
    proposed: u64,
) -> Result<FullRatchetState, StepError> {
    let (remote_identity, remote_device) = sender(ctx)?;
    let channel_id = ctx.channel_id(remote_identity, remote_device);
    let mut channel = confirmed_channel(ctx, &channel_id)?;
    let full_ratchet_count = proposed.max(channel.next_full_ratchet_count());

    let ephemeral = AgreementKeyPair::generate(ctx.prng());
    let shared = ephemeral.agree(alice_ephemeral)?;

    // Reply under the current epoch: Alice cannot decrypt the new one yet.
    ctx.post(
        Destination::Direct(channel_id),
        &FullRatchetMessage::BobEphemeralKey {
            ephemeral_public: ephemeral.public_key(),
            full_ratchet_count,
        },
    )?;

    let (now, config) = (ctx.now(), ctx.config());
    channel.apply_full_ratchet(ctx.txn(), &shared, full_ratchet_count, false, now, config)?;

    Ok(FullRatchetState::BobWaitingForAck { remote_identity, remote_device, full_ratchet_count })
}

fn activate(
    ctx: &mut StepContext<'_, '_>,
    channel_id: ChannelId,
    ephemeral: &AgreementKeyPair,
    bob_ephemeral: &[u8; PUBLIC_KEY_SIZE],
    proposed: u64,
    full_ratchet_count: u64,
) -> Result<FullRatchetState, StepError> {
    let mut channel = confirmed_channel(ctx, &channel_id)?;
    require_answer(proposed, full_ratchet_count, &channel)?;
    let shared = ephemeral.agree(bob_ephemeral)?;

    let (now, config) = (ctx.now(), ctx.config());
    channel.apply_full_ratchet(ctx.txn(), &shared, full_ratchet_count, true, now, config)?;

    ctx.post(Destination::Direct(channel_id), &FullRatchetMessage::Ack { full_ratchet_count })?;
    ctx.notify(Notification::FullRatchetCompleted { channel: channel_id, full_ratchet_count });

    Ok(FullRatchetState::FullRatchetDone { full_ratchet_count })
}

fn receive_ack(
    ctx: &mut StepContext<'_, '_>,
    channel_id: ChannelId,
    full_ratchet_count: u64,
) -> Result<FullRatchetState, StepError> {
    let mut channel = confirmed_channel(ctx, &channel_id)?;

    let (now, config) = (ctx.now(), ctx.config());
    channel.activate(ctx.txn(), full_ratchet_count, now, config)?;
    ctx.notify(Notification::FullRatchetCompleted { channel: channel_id, full_ratchet_count });

    Ok(FullRatchetState::FullRatchetDone { full_ratchet_count })
}
