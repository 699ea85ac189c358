//! Protocol registry and step index.

use std::{
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
};

use keyloom_proto::{MessageKind, ProtocolError, ProtocolId, ProtocolMessage, ReceptionKind};

use super::{
    CatalogError, Protocol, ProtocolMessageSet, ProtocolState, StateId, StepContext, StepError,
    definitions::{ChannelCreation, DeviceDiscovery, FullRatchet},
};

/// Result of a step that moved its instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTransition {
    /// New state id
    pub state_id: StateId,
    /// Encoded new state
    pub state: Vec<u8>,
    /// No further step may run
    pub terminal: bool,
}

/// Type-erased view of a [`Protocol`], so the catalog can hold protocols
/// with different state and message types.
pub trait ProtocolRunner: Send + Sync {
    /// Catalog id.
    fn id(&self) -> ProtocolId;

    /// Name for logs.
    fn name(&self) -> &'static str;

    /// `(from, message, reception)` of every step, in table order.
    fn descriptors(&self) -> Vec<(StateId, MessageKind, ReceptionKind)>;

    /// True if `body` decodes as a message of `kind`.
    fn decodes(&self, kind: MessageKind, body: &[u8]) -> bool;

    /// Encoded cancelled state.
    fn cancelled_state(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Run the step at `step_index` of the table.
    ///
    /// `state` is the stored encoded state, or `None` for a fresh instance.
    fn run(
        &self,
        step_index: usize,
        state: Option<&[u8]>,
        message: &ProtocolMessage,
        ctx: &mut StepContext<'_, '_>,
    ) -> Result<Option<StepTransition>, StepError>;
}

/// Adapter from a concrete [`Protocol`] to a [`ProtocolRunner`].
pub struct Registered<P: Protocol> {
    protocol: P,
    _marker: PhantomData<fn() -> P>,
}

impl<P: Protocol> Registered<P> {
    /// Wrap a protocol.
    pub fn new(protocol: P) -> Self {
        Self { protocol, _marker: PhantomData }
    }
}

impl<P: Protocol> ProtocolRunner for Registered<P> {
    fn id(&self) -> ProtocolId {
        P::ID
    }

    fn name(&self) -> &'static str {
        P::NAME
    }

    fn descriptors(&self) -> Vec<(StateId, MessageKind, ReceptionKind)> {
        P::steps().iter().map(|d| (d.from, d.message, d.reception)).collect()
    }

    fn decodes(&self, kind: MessageKind, body: &[u8]) -> bool {
        P::Message::decode(kind, body).is_ok()
    }

    fn cancelled_state(&self) -> Result<Vec<u8>, ProtocolError> {
        keyloom_proto::encode(&P::State::cancelled())
    }

    fn run(
        &self,
        step_index: usize,
        state: Option<&[u8]>,
        message: &ProtocolMessage,
        ctx: &mut StepContext<'_, '_>,
    ) -> Result<Option<StepTransition>, StepError> {
        let descriptor = P::steps().get(step_index).ok_or(StepError::NotApplicable)?;

        let state = match state {
            Some(bytes) => keyloom_proto::decode::<P::State>(bytes)?,
            None => P::State::initial(),
        };
        if state.id() != descriptor.from {
            return Err(StepError::NotApplicable);
        }

        let decoded = P::Message::decode(message.kind, &message.body)?;
        let Some(next) = self.protocol.execute(descriptor.step, state, decoded, ctx)? else {
            return Ok(None);
        };

        let state_id = next.id();
        Ok(Some(StepTransition {
            state_id,
            state: keyloom_proto::encode(&next)?,
            terminal: next.is_terminal() || state_id == StateId::CANCELLED,
        }))
    }
}

/// Where a `(protocol, state, message)` triple leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogStep {
    /// Index into the protocol's step table
    pub index: usize,
    /// Reception kind the step requires
    pub reception: ReceptionKind,
}

/// Registry of protocols and the index of their steps.
#[derive(Default)]
pub struct Catalog {
    runners: BTreeMap<ProtocolId, Box<dyn ProtocolRunner>>,
    steps: HashMap<(ProtocolId, StateId, MessageKind), CatalogStep>,
}

impl Catalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every protocol shipped with the engine.
    pub fn builtin() -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        catalog.register(ChannelCreation)?;
        catalog.register(FullRatchet)?;
        catalog.register(DeviceDiscovery)?;
        Ok(catalog)
    }

    /// Add a protocol.
    ///
    /// Registration is all or nothing: a rejected protocol leaves the
    /// catalog unchanged.
    ///
    /// # Errors
    ///
    /// - `DuplicateProtocol` if the id is taken
    /// - `AmbiguousStep` if two steps share a start state and message kind
    /// - `StepFromCancelled` if a step starts from the cancelled state
    pub fn register<P: Protocol>(&mut self, protocol: P) -> Result<(), CatalogError> {
        self.register_runner(Box::new(Registered::new(protocol)))
    }

    /// Add a type-erased protocol. Same rules as [`Catalog::register`].
    pub fn register_runner(&mut self, runner: Box<dyn ProtocolRunner>) -> Result<(), CatalogError> {
        let protocol = runner.id();
        if self.runners.contains_key(&protocol) {
            return Err(CatalogError::DuplicateProtocol(protocol));
        }

        let mut steps = HashMap::new();
        for (index, (state, message, reception)) in runner.descriptors().into_iter().enumerate() {
            if state == StateId::CANCELLED {
                return Err(CatalogError::StepFromCancelled { protocol, message });
            }
            if steps.insert((protocol, state, message), CatalogStep { index, reception }).is_some()
            {
                return Err(CatalogError::AmbiguousStep { protocol, state, message });
            }
        }

        self.steps.extend(steps);
        self.runners.insert(protocol, runner);
        Ok(())
    }

    /// Registered protocol by id.
    pub fn runner(&self, protocol: ProtocolId) -> Option<&dyn ProtocolRunner> {
        self.runners.get(&protocol).map(Box::as_ref)
    }

    /// The single step for a triple, if any.
    pub fn lookup(
        &self,
        protocol: ProtocolId,
        state: StateId,
        message: MessageKind,
    ) -> Option<CatalogStep> {
        self.steps.get(&(protocol, state, message)).copied()
    }

    /// Ids of every registered protocol.
    pub fn protocols(&self) -> impl Iterator<Item = ProtocolId> + '_ {
        self.runners.keys().copied()
    }
}
