//! Channel establishment between two devices.
//!
//! Initiator (Alice) and responder (Bob) exchange ephemeral X25519 keys over
//! the asymmetric channel, each combining three agreements into the channel
//! secret:
//!
//! ```text
//! Alice                                   Bob
//!   │ Start (local)                         │
//!   │── Ping { eA } (sealed) ──────────────▶│ create channel if none
//!   │◀────────────── K1 { eB } (sealed) ────│
//!   │ create + confirm channel              │
//!   │── Confirmation { tag } (sealed) ─────▶│ check tag, confirm
//! ```
//!
//! `secret = combine(eA·eB, sA·eB, eA·sB)` where `s` are identity keys, and
//! the confirmation tag is an HMAC over the transcript of both endpoints and
//! both ephemeral keys. A bad tag cancels Bob's instance and leaves his
//! channel unconfirmed.
//!
//! Sealed boxes are anonymous, so a ping only claims its sender. Bob keeps
//! any channel he already holds with that device until the tag proves the
//! claim, and only then swaps in the new one. Without an existing channel
//! he creates the new one right away so units Alice sends after confirming
//! open even if they overtake the confirmation.

use keyloom_crypto::{
    AgreementKeyPair, PUBLIC_KEY_SIZE, SharedSecret, combine_secrets, confirmation_tag,
    transcript_hash,
};
use keyloom_proto::{
    DeviceUid, IdentityId, MessageKind, ProtocolError, ProtocolId, ReceptionKind, codec,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{require_sender, sender, tags_match};
use crate::{
    action::Notification,
    channel::Channel,
    identity::{Contact, OwnedIdentity},
    protocol::{
        Destination, Protocol, ProtocolMessageSet, ProtocolState, StateId, StepContext,
        StepDescriptor, StepError,
    },
};

/// Local request to open a channel.
pub const START: MessageKind = MessageKind(0);
/// Initiator's ephemeral key.
pub const PING: MessageKind = MessageKind(1);
/// Responder's ephemeral key.
pub const K1: MessageKind = MessageKind(2);
/// Key confirmation over the new channel.
pub const CONFIRMATION: MessageKind = MessageKind(3);

const WAITING_FOR_K1: StateId = StateId(2);
const WAITING_FOR_CONFIRMATION: StateId = StateId(3);
const CHANNEL_CONFIRMED: StateId = StateId(4);

/// Channel creation protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelCreation;

/// Channel creation states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChannelCreationState {
    /// Fresh instance
    Initial,
    /// Cancelled after a violation
    Cancelled,
    /// Alice sent her ephemeral key
    WaitingForK1 {
        /// Bob's identity
        remote_identity: IdentityId,
        /// Bob's device
        remote_device: DeviceUid,
        /// Alice's ephemeral key pair
        ephemeral: AgreementKeyPair,
    },
    /// Bob answered and waits for Alice's tag
    WaitingForConfirmation {
        /// Alice's identity
        remote_identity: IdentityId,
        /// Alice's device
        remote_device: DeviceUid,
        /// `eA`
        alice_ephemeral: [u8; PUBLIC_KEY_SIZE],
        /// Bob's ephemeral key pair
        ephemeral: AgreementKeyPair,
        /// A channel existed before the ping and is replaced on confirmation
        replaces_existing: bool,
    },
    /// Both ends hold the channel
    ChannelConfirmed {
        /// Peer identity
        remote_identity: IdentityId,
        /// Peer device
        remote_device: DeviceUid,
    },
}

impl ProtocolState for ChannelCreationState {
    fn id(&self) -> StateId {
        match self {
            Self::Initial => StateId::INITIAL,
            Self::Cancelled => StateId::CANCELLED,
            Self::WaitingForK1 { .. } => WAITING_FOR_K1,
            Self::WaitingForConfirmation { .. } => WAITING_FOR_CONFIRMATION,
            Self::ChannelConfirmed { .. } => CHANNEL_CONFIRMED,
        }
    }

    fn initial() -> Self {
        Self::Initial
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ChannelConfirmed { .. })
    }
}

/// Channel creation messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCreationMessage {
    /// Open a channel to a remote device
    Start {
        /// Remote identity
        remote_identity: IdentityId,
        /// Remote device
        remote_device: DeviceUid,
    },
    /// Alice's ephemeral public key
    Ping {
        /// `eA`
        ephemeral_public: [u8; PUBLIC_KEY_SIZE],
    },
    /// Bob's ephemeral public key
    K1 {
        /// `eB`
        ephemeral_public: [u8; PUBLIC_KEY_SIZE],
    },
    /// Alice's key confirmation
    Confirmation {
        /// HMAC over the handshake transcript
        tag: [u8; 32],
    },
}

impl ProtocolMessageSet for ChannelCreationMessage {
    fn kind(&self) -> MessageKind {
        match self {
            Self::Start { .. } => START,
            Self::Ping { .. } => PING,
            Self::K1 { .. } => K1,
            Self::Confirmation { .. } => CONFIRMATION,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        codec::encode(self)
    }

    fn decode(kind: MessageKind, body: &[u8]) -> Result<Self, ProtocolError> {
        let message: Self = codec::decode(body)?;
        if message.kind() != kind {
            return Err(ProtocolError::UnknownMessageKind {
                protocol: ChannelCreation::ID.0,
                kind: kind.0,
            });
        }
        Ok(message)
    }
}

/// Channel creation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCreationStep {
    /// Alice: generate `eA` and seal a ping to Bob
    SendPing,
    /// Bob: answer with `eB`, creating the channel if there is none
    AnswerPing,
    /// Alice: create and confirm the channel, send the tag
    SendConfirmation,
    /// Bob: check the tag, then install and confirm the channel
    CheckConfirmation,
}

const STEPS: &[StepDescriptor<ChannelCreationStep>] = &[
    StepDescriptor {
        step: ChannelCreationStep::SendPing,
        from: StateId::INITIAL,
        message: START,
        reception: ReceptionKind::Local,
    },
    StepDescriptor {
        step: ChannelCreationStep::AnswerPing,
        from: StateId::INITIAL,
        message: PING,
        reception: ReceptionKind::Asymmetric,
    },
    StepDescriptor {
        step: ChannelCreationStep::SendConfirmation,
        from: WAITING_FOR_K1,
        message: K1,
        reception: ReceptionKind::Asymmetric,
    },
    StepDescriptor {
        step: ChannelCreationStep::CheckConfirmation,
        from: WAITING_FOR_CONFIRMATION,
        message: CONFIRMATION,
        reception: ReceptionKind::Asymmetric,
    },
];

/// One side of the handshake transcript.
struct Endpoint<'k> {
    identity: IdentityId,
    device: DeviceUid,
    ephemeral: &'k [u8; PUBLIC_KEY_SIZE],
}

fn transcript(alice: &Endpoint<'_>, bob: &Endpoint<'_>) -> [u8; 32] {
    transcript_hash(&[
        alice.identity.as_bytes().as_slice(),
        alice.device.as_bytes().as_slice(),
        alice.ephemeral.as_slice(),
        bob.identity.as_bytes().as_slice(),
        bob.device.as_bytes().as_slice(),
        bob.ephemeral.as_slice(),
    ])
}

/// `combine(eA·eB, sA·eB, eA·sB)`, computed in the same order on both sides.
fn handshake_secret(
    ephemeral_agreement: SharedSecret,
    alice_static_agreement: SharedSecret,
    bob_static_agreement: SharedSecret,
) -> SharedSecret {
    combine_secrets(&[&ephemeral_agreement, &alice_static_agreement, &bob_static_agreement])
}

/// Bob's view of the handshake.
struct Answer {
    remote_identity: IdentityId,
    remote_device: DeviceUid,
    alice_ephemeral: [u8; PUBLIC_KEY_SIZE],
    ephemeral: AgreementKeyPair,
    replaces_existing: bool,
}

impl Answer {
    fn secret(&self, owned: &OwnedIdentity) -> Result<SharedSecret, StepError> {
        Ok(handshake_secret(
            self.ephemeral.agree(&self.alice_ephemeral)?,
            self.ephemeral.agree(self.remote_identity.as_bytes())?,
            owned.key_pair().agree(&self.alice_ephemeral)?,
        ))
    }

    fn expected_tag(&self, owned: &OwnedIdentity, shared: &SharedSecret) -> [u8; 32] {
        let bob_ephemeral = self.ephemeral.public_key();
        confirmation_tag(
            shared,
            &transcript(
                &Endpoint {
                    identity: self.remote_identity,
                    device: self.remote_device,
                    ephemeral: &self.alice_ephemeral,
                },
                &Endpoint {
                    identity: owned.identity,
                    device: owned.current_device,
                    ephemeral: &bob_ephemeral,
                },
            ),
        )
    }

    fn into_state(self) -> ChannelCreationState {
        ChannelCreationState::WaitingForConfirmation {
            remote_identity: self.remote_identity,
            remote_device: self.remote_device,
            alice_ephemeral: self.alice_ephemeral,
            ephemeral: self.ephemeral,
            replaces_existing: self.replaces_existing,
        }
    }
}

impl Protocol for ChannelCreation {
    const ID: ProtocolId = ProtocolId(1);
    const NAME: &'static str = "channel-creation";

    type State = ChannelCreationState;
    type Message = ChannelCreationMessage;
    type Step = ChannelCreationStep;

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
        use ChannelCreationMessage as M;
        use ChannelCreationState as S;
        use ChannelCreationStep as Step;

        match (step, state, message) {
            (Step::SendPing, S::Initial, M::Start { remote_identity, remote_device }) => {
                send_ping(ctx, remote_identity, remote_device).map(Some)
            },
            (Step::AnswerPing, S::Initial, M::Ping { ephemeral_public }) => {
                answer_ping(ctx, &ephemeral_public).map(Some)
            },
            (
                Step::SendConfirmation,
                S::WaitingForK1 { remote_identity, remote_device, ephemeral },
                M::K1 { ephemeral_public },
            ) => send_confirmation(
                ctx,
                remote_identity,
                remote_device,
                &ephemeral,
                &ephemeral_public,
            )
            .map(Some),
            (
                Step::CheckConfirmation,
                S::WaitingForConfirmation {
                    remote_identity,
                    remote_device,
                    alice_ephemeral,
                    ephemeral,
                    replaces_existing,
                },
                M::Confirmation { tag },
            ) => {
                let answer = Answer {
                    remote_identity,
                    remote_device,
                    alice_ephemeral,
                    ephemeral,
                    replaces_existing,
                };
                check_confirmation(ctx, &answer, &tag).map(Some)
            },
            _ => Err(StepError::NotApplicable),
        }
    }
}

fn send_ping(
    ctx: &mut StepContext<'_, '_>,
    remote_identity: IdentityId,
    remote_device: DeviceUid,
) -> Result<ChannelCreationState, StepError> {
    if remote_identity == ctx.owned().identity && remote_device == ctx.owned().current_device {
        return Err(StepError::violation("cannot open a channel to this device"));
    }

    let ephemeral = AgreementKeyPair::generate(ctx.prng());
    ctx.post(
        Destination::Asymmetric { remote_identity, remote_device },
        &ChannelCreationMessage::Ping { ephemeral_public: ephemeral.public_key() },
    )?;

    Ok(ChannelCreationState::WaitingForK1 { remote_identity, remote_device, ephemeral })
}

fn answer_ping(
    ctx: &mut StepContext<'_, '_>,
    alice_ephemeral: &[u8; PUBLIC_KEY_SIZE],
) -> Result<ChannelCreationState, StepError> {
    let (remote_identity, remote_device) = sender(ctx)?;
    let owned = ctx.owned();
    let config = ctx.config();
    let channel_id = ctx.channel_id(remote_identity, remote_device);

    let answer = Answer {
        remote_identity,
        remote_device,
        alice_ephemeral: *alice_ephemeral,
        ephemeral: AgreementKeyPair::generate(ctx.prng()),
        replaces_existing: Channel::load(ctx.txn(), &channel_id)?.is_some(),
    };
    let shared = answer.secret(owned)?;

    if answer.replaces_existing {
        debug!(channel = ?channel_id, "keeping existing channel until confirmation");
    } else {
        Channel::create(ctx.txn(), channel_id, owned.current_device, &shared, config)?;
    }

    ctx.post(
        Destination::Asymmetric { remote_identity, remote_device },
        &ChannelCreationMessage::K1 { ephemeral_public: answer.ephemeral.public_key() },
    )?;

    Ok(answer.into_state())
}

fn send_confirmation(
    ctx: &mut StepContext<'_, '_>,
    remote_identity: IdentityId,
    remote_device: DeviceUid,
    ephemeral: &AgreementKeyPair,
    bob_ephemeral: &[u8; PUBLIC_KEY_SIZE],
) -> Result<ChannelCreationState, StepError> {
    require_sender(ctx, remote_identity, remote_device)?;
    let owned = ctx.owned();
    let config = ctx.config();

    let shared = handshake_secret(
        ephemeral.agree(bob_ephemeral)?,
        owned.key_pair().agree(bob_ephemeral)?,
        ephemeral.agree(remote_identity.as_bytes())?,
    );

    let channel_id = ctx.channel_id(remote_identity, remote_device);
    let mut channel =
        Channel::create(ctx.txn(), channel_id, owned.current_device, &shared, config)?;
    channel.confirm(ctx.txn())?;

    let alice_ephemeral = ephemeral.public_key();
    let tag = confirmation_tag(
        &shared,
        &transcript(
            &Endpoint {
                identity: owned.identity,
                device: owned.current_device,
                ephemeral: &alice_ephemeral,
            },
            &Endpoint {
                identity: remote_identity,
                device: remote_device,
                ephemeral: bob_ephemeral,
            },
        ),
    );

    ctx.post(
        Destination::Asymmetric { remote_identity, remote_device },
        &ChannelCreationMessage::Confirmation { tag },
    )?;
    Contact::add_device(ctx.txn(), owned.identity, remote_identity, remote_device)?;
    ctx.notify(Notification::ChannelConfirmed { channel: channel_id });

    Ok(ChannelCreationState::ChannelConfirmed { remote_identity, remote_device })
}

fn check_confirmation(
    ctx: &mut StepContext<'_, '_>,
    answer: &Answer,
    tag: &[u8; 32],
) -> Result<ChannelCreationState, StepError> {
    let (remote_identity, remote_device) = (answer.remote_identity, answer.remote_device);
    require_sender(ctx, remote_identity, remote_device)?;
    let owned = ctx.owned();
    let config = ctx.config();

    let shared = answer.secret(owned)?;
    if !tags_match(&answer.expected_tag(owned, &shared), tag) {
        return Err(StepError::violation("confirmation tag mismatch"));
    }

    let channel_id = ctx.channel_id(remote_identity, remote_device);
    let mut channel = if answer.replaces_existing {
        Channel::create(ctx.txn(), channel_id, owned.current_device, &shared, config)?
    } else {
        Channel::require(ctx.txn(), &channel_id)?
    };
    channel.confirm(ctx.txn())?;
    Contact::add_device(ctx.txn(), owned.identity, remote_identity, remote_device)?;
    ctx.notify(Notification::ChannelConfirmed { channel: channel_id });

    Ok(ChannelCreationState::ChannelConfirmed { remote_identity, remote_device })
}
