//! Device discovery: ask the server for the devices of an identity.
//!
//! The device that asked stores the list as the contact's devices and
//! forwards it to every other device of its own identity, so all owned
//! devices converge on the same contact state without querying the server
//! themselves.

use keyloom_proto::{
    DeviceUid, IdentityId, MessageKind, ProtocolError, ProtocolId, QueryKind, QueryResponse,
    ReceptionKind, codec,
};
use serde::{Deserialize, Serialize};

use super::sender;
use crate::{
    action::Notification,
    identity::Contact,
    protocol::{
        Destination, Protocol, ProtocolMessageSet, ProtocolState, StateId, StepContext,
        StepDescriptor, StepError,
    },
};

/// Local request to discover the devices of an identity.
pub const START: MessageKind = MessageKind(0);
/// Server answer.
pub const SERVER_RESPONSE: MessageKind = MessageKind(1);
/// Result forwarded by another owned device.
pub const OWNED_DEVICES_UPDATE: MessageKind = MessageKind(2);

const WAITING_FOR_SERVER_RESPONSE: StateId = StateId(2);
const DEVICES_DISCOVERED: StateId = StateId(3);

/// Device discovery protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceDiscovery;

/// Device discovery states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceDiscoveryState {
    /// Fresh instance
    Initial,
    /// Cancelled after a violation
    Cancelled,
    /// Query sent
    WaitingForServerResponse {
        /// Identity being looked up
        identity: IdentityId,
    },
    /// Device list stored
    DevicesDiscovered {
        /// Identity that was looked up
        identity: IdentityId,
        /// Devices found
        devices: Vec<DeviceUid>,
    },
}

impl ProtocolState for DeviceDiscoveryState {
    fn id(&self) -> StateId {
        match self {
            Self::Initial => StateId::INITIAL,
            Self::Cancelled => StateId::CANCELLED,
            Self::WaitingForServerResponse { .. } => WAITING_FOR_SERVER_RESPONSE,
            Self::DevicesDiscovered { .. } => DEVICES_DISCOVERED,
        }
    }

    fn initial() -> Self {
        Self::Initial
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DevicesDiscovered { .. })
    }
}

/// Device discovery messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDiscoveryMessage {
    /// Look up `identity`
    Start {
        /// Identity to look up
        identity: IdentityId,
    },
    /// Server answer, body is a bare [`QueryResponse`]
    ServerResponse(QueryResponse),
    /// Result from another device of the same identity
    OwnedDevicesUpdate {
        /// Identity that was looked up
        identity: IdentityId,
        /// Devices found
        devices: Vec<DeviceUid>,
    },
}

#[derive(Serialize, Deserialize)]
struct StartBody {
    identity: IdentityId,
}

#[derive(Serialize, Deserialize)]
struct UpdateBody {
    identity: IdentityId,
    devices: Vec<DeviceUid>,
}

impl ProtocolMessageSet for DeviceDiscoveryMessage {
    fn kind(&self) -> MessageKind {
        match self {
            Self::Start { .. } => START,
            Self::ServerResponse(_) => SERVER_RESPONSE,
            Self::OwnedDevicesUpdate { .. } => OWNED_DEVICES_UPDATE,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Start { identity } => codec::encode(&StartBody { identity: *identity }),
            Self::ServerResponse(response) => codec::encode(response),
            Self::OwnedDevicesUpdate { identity, devices } => {
                codec::encode(&UpdateBody { identity: *identity, devices: devices.clone() })
            },
        }
    }

    fn decode(kind: MessageKind, body: &[u8]) -> Result<Self, ProtocolError> {
        match kind {
            START => {
                let StartBody { identity } = codec::decode(body)?;
                Ok(Self::Start { identity })
            },
            SERVER_RESPONSE => Ok(Self::ServerResponse(codec::decode(body)?)),
            OWNED_DEVICES_UPDATE => {
                let UpdateBody { identity, devices } = codec::decode(body)?;
                Ok(Self::OwnedDevicesUpdate { identity, devices })
            },
            _ => Err(ProtocolError::UnknownMessageKind {
                protocol: DeviceDiscovery::ID.0,
                kind: kind.0,
            }),
        }
    }
}

/// Device discovery steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDiscoveryStep {
    /// Send the server query
    Query,
    /// Store the answer and forward it to owned devices
    StoreResponse,
    /// Store a list forwarded by another owned device
    StoreOwnedUpdate,
}

const STEPS: &[StepDescriptor<DeviceDiscoveryStep>] = &[
    StepDescriptor {
        step: DeviceDiscoveryStep::Query,
        from: StateId::INITIAL,
        message: START,
        reception: ReceptionKind::Local,
    },
    StepDescriptor {
        step: DeviceDiscoveryStep::StoreResponse,
        from: WAITING_FOR_SERVER_RESPONSE,
        message: SERVER_RESPONSE,
        reception: ReceptionKind::ServerResponse,
    },
    StepDescriptor {
        step: DeviceDiscoveryStep::StoreOwnedUpdate,
        from: StateId::INITIAL,
        message: OWNED_DEVICES_UPDATE,
        reception: ReceptionKind::Direct,
    },
];

impl Protocol for DeviceDiscovery {
    const ID: ProtocolId = ProtocolId(3);
    const NAME: &'static str = "device-discovery";

    type State = DeviceDiscoveryState;
    type Message = DeviceDiscoveryMessage;
    type Step = DeviceDiscoveryStep;

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
        use DeviceDiscoveryMessage as M;
        use DeviceDiscoveryState as S;
        use DeviceDiscoveryStep as Step;

        match (step, state, message) {
            (Step::Query, S::Initial, M::Start { identity }) => {
                ctx.query_server(QueryKind::DeviceDiscovery { identity }, SERVER_RESPONSE);
                Ok(Some(S::WaitingForServerResponse { identity }))
            },
            (
                Step::StoreResponse,
                S::WaitingForServerResponse { identity },
                M::ServerResponse(QueryResponse::DeviceDiscovery { devices }),
            ) => {
                store_devices(ctx, identity, &devices)?;
                ctx.post(
                    Destination::AllOwnedDevices,
                    &M::OwnedDevicesUpdate { identity, devices: devices.clone() },
                )?;
                Ok(Some(S::DevicesDiscovered { identity, devices }))
            },
            (Step::StoreOwnedUpdate, S::Initial, M::OwnedDevicesUpdate { identity, devices }) => {
                let (remote_identity, _) = sender(ctx)?;
                if remote_identity != ctx.owned().identity {
                    return Err(StepError::violation(
                        "device list forwarded by a device of another identity",
                    ));
                }
                store_devices(ctx, identity, &devices)?;
                Ok(Some(S::DevicesDiscovered { identity, devices }))
            },
            _ => Err(StepError::NotApplicable),
        }
    }
}

fn store_devices(
    ctx: &mut StepContext<'_, '_>,
    identity: IdentityId,
    devices: &[DeviceUid],
) -> Result<(), StepError> {
    let owned_identity = ctx.owned().identity;
    Contact::replace_devices(ctx.txn(), owned_identity, identity, devices.iter().copied())?;
    ctx.notify(Notification::DevicesDiscovered {
        owned_identity,
        identity,
        devices: devices.to_vec(),
    });
    Ok(())
}
