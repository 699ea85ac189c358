//! Several engines talking through an in-process router.
//!
//! Every node owns its own storage; a shared [`SimEnv`] keeps randomness and
//! the clock deterministic. [`World::run`] executes the actions a dispatch
//! returns until the network is quiet, answering server queries from a
//! static directory.
//!
//! # Invariants Tested
//!
//! - Channel creation confirms both ends and records the peer device
//! - Units decrypt in any order, exactly once
//! - A full ratchet activates the same epoch on both ends and old units keep
//!   decrypting until their grace period ends
//! - Device discovery results reach every device of the asking identity
//! - A full ratchet survives a lost reply or a lost acknowledgement
//! - A wrong confirmation tag cancels the responder and leaves the channel
//!   unconfirmed
//! - A ping claiming another sender cannot replace a confirmed channel
//! - A crash between receipt and dispatch is recovered by inbox replay

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use keyloom_core::{
    CancelReason, ChannelError, ChannelId, DiscardReason, Dispatch, DispatchOutcome, Engine,
    EngineAction, EngineConfig, EngineError, Environment, MemoryStorage, Notification,
    OwnedIdentity, SimEnv, Storage, StorageError, Table, Transaction, WriteBatch,
    protocol::{
        Protocol, ProtocolMessageSet,
        definitions::{
            ChannelCreation, ChannelCreationMessage, ChannelCreationState, DeviceDiscovery,
            DeviceDiscoveryMessage, DeviceDiscoveryState, FullRatchetState, channel_creation,
            device_discovery,
        },
    },
};
use keyloom_crypto::{SeededPrng, seal};
use keyloom_proto::{
    DeviceUid, Envelope, EnvelopeBody, IdentityId, InstanceUid, QueryKind, QueryResponse,
    WireProtocolMessage,
};

const NEVER: usize = usize::MAX;

/// Memory storage that can be told to fail one upcoming commit.
#[derive(Clone)]
struct CrashableStorage {
    inner: MemoryStorage,
    crash_in: Arc<AtomicUsize>,
}

impl CrashableStorage {
    fn new() -> Self {
        Self { inner: MemoryStorage::new(), crash_in: Arc::new(AtomicUsize::new(NEVER)) }
    }

    /// Let `successful` commits through, then fail the next one.
    fn crash_after(&self, successful: usize) {
        self.crash_in.store(successful, Ordering::SeqCst);
    }
}

impl Storage for CrashableStorage {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(table, key)
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.inner.scan_prefix(table, prefix)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        match self.crash_in.load(Ordering::SeqCst) {
            NEVER => {},
            0 => {
                self.crash_in.store(NEVER, Ordering::SeqCst);
                return Err(StorageError::Io("power loss".to_string()));
            },
            remaining => self.crash_in.store(remaining - 1, Ordering::SeqCst),
        }
        self.inner.commit(batch)
    }
}

struct Node {
    engine: Engine<CrashableStorage, SimEnv>,
    owned: OwnedIdentity,
}

struct World {
    env: SimEnv,
    config: EngineConfig,
    nodes: Vec<Node>,
    directory: BTreeMap<IdentityId, Vec<DeviceUid>>,
    notifications: Vec<(usize, Notification)>,
    outcomes: Vec<(usize, DispatchOutcome)>,
}

impl World {
    fn new(seed: u64) -> Self {
        Self {
            env: SimEnv::with_seed(seed),
            config: EngineConfig { reprovisioning_threshold: 5, ..Default::default() },
            nodes: Vec::new(),
            directory: BTreeMap::new(),
            notifications: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    fn add_node(&mut self, owned: Option<OwnedIdentity>) -> usize {
        let engine =
            Engine::new(CrashableStorage::new(), self.env.clone(), self.config).unwrap();
        let owned = match owned {
            Some(owned) => {
                engine.register_owned_identity(&owned).unwrap();
                owned
            },
            None => engine.create_owned_identity().unwrap(),
        };
        self.directory.entry(owned.identity).or_default().push(owned.current_device);
        self.nodes.push(Node { engine, owned });
        self.nodes.len() - 1
    }

    /// A device with a fresh identity.
    fn add_identity(&mut self) -> usize {
        self.add_node(None)
    }

    /// Another device of the identity of `node`.
    fn add_device(&mut self, node: usize) -> usize {
        let key_pair = self.nodes[node].owned.key_pair().clone();
        let device = DeviceUid::from_bytes(self.env.random_32());
        self.add_node(Some(OwnedIdentity::from_key_pair(key_pair, device)))
    }

    fn engine(&self, node: usize) -> &Engine<CrashableStorage, SimEnv> {
        &self.nodes[node].engine
    }

    fn identity(&self, node: usize) -> IdentityId {
        self.nodes[node].owned.identity
    }

    fn device(&self, node: usize) -> DeviceUid {
        self.nodes[node].owned.current_device
    }

    /// Channel held by `from` towards `to`.
    fn channel(&self, from: usize, to: usize) -> ChannelId {
        ChannelId {
            owned_identity: self.identity(from),
            remote_identity: self.identity(to),
            remote_device: self.device(to),
        }
    }

    fn route(&self, envelope: &Envelope) -> usize {
        self.nodes
            .iter()
            .position(|node| {
                node.owned.identity == envelope.to_identity
                    && node.owned.current_device == envelope.to_device
            })
            .unwrap()
    }

    fn deliver(&self, envelope: &Envelope) -> (usize, Dispatch) {
        let target = self.route(envelope);
        (target, self.engine(target).receive_envelope(envelope).unwrap())
    }

    /// Execute actions until nothing is left in flight.
    fn run(&mut self, origin: usize, actions: Vec<EngineAction>) {
        let mut queue: VecDeque<_> = actions.into_iter().map(|action| (origin, action)).collect();

        while let Some((source, action)) = queue.pop_front() {
            let (target, dispatch) = match action {
                EngineAction::Send(envelope) => self.deliver(&envelope),
                EngineAction::Query(query) => {
                    let QueryKind::DeviceDiscovery { identity } = &query.query;
                    let devices = self.directory.get(identity).cloned().unwrap_or_default();
                    let answer =
                        query.respond(&QueryResponse::DeviceDiscovery { devices }).unwrap();
                    (source, self.engine(source).submit_protocol_message(answer).unwrap())
                },
                EngineAction::Loopback(message) => {
                    (source, self.engine(source).submit_protocol_message(message).unwrap())
                },
                EngineAction::Notify(notification) => {
                    self.notifications.push((source, notification));
                    continue;
                },
            };

            self.outcomes.push((target, dispatch.outcome));
            queue.extend(dispatch.actions.into_iter().map(|action| (target, action)));
        }
    }

    fn connect(&mut self, from: usize, to: usize) -> InstanceUid {
        let (uid, dispatch) = self
            .engine(from)
            .start_channel_creation(self.identity(from), self.identity(to), self.device(to))
            .unwrap();
        self.run(from, dispatch.actions);
        uid
    }

    fn notified(&self, node: usize, notification: &Notification) -> bool {
        self.notifications.iter().any(|(source, n)| *source == node && n == notification)
    }

    /// Every delivered message ran a step.
    fn all_steps_applied(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| {
            !matches!(outcome, DispatchOutcome::Cancelled(_) | DispatchOutcome::Discarded(_))
        })
    }
}

fn sends(actions: Vec<EngineAction>) -> Vec<Envelope> {
    actions
        .into_iter()
        .filter_map(|action| match action {
            EngineAction::Send(envelope) => Some(envelope),
            _ => None,
        })
        .collect()
}

fn single_send(actions: Vec<EngineAction>) -> Envelope {
    let mut envelopes = sends(actions);
    assert_eq!(envelopes.len(), 1);
    envelopes.remove(0)
}

/// An envelope carrying `wire` over the channel from `from` to `to`.
fn forge(world: &World, from: usize, to: usize, wire: &WireProtocolMessage) -> Envelope {
    let plaintext = wire.to_bytes().unwrap();
    let (key_id, ciphertext) =
        world.engine(from).encrypt_unit(&world.channel(from, to), &plaintext).unwrap();
    Envelope {
        from_identity: world.identity(from),
        from_device: world.device(from),
        to_identity: world.identity(to),
        to_device: world.device(to),
        body: EnvelopeBody::Channel { key_id, ciphertext },
    }
}

/// A sealed envelope carrying `wire` to `to`, claiming to come from `claimed`.
fn forge_sealed(
    world: &World,
    claimed: usize,
    to: usize,
    wire: &WireProtocolMessage,
) -> Envelope {
    let mut prng = SeededPrng::from_u64(0x5EA1);
    let sealed =
        seal(world.identity(to).as_bytes(), &wire.to_bytes().unwrap(), &mut prng).unwrap();
    Envelope {
        from_identity: world.identity(claimed),
        from_device: world.device(claimed),
        to_identity: world.identity(to),
        to_device: world.device(to),
        body: EnvelopeBody::Sealed { sealed },
    }
}

fn epochs(world: &World, node: usize, channel: &ChannelId) -> (u64, u64) {
    let stored = world.engine(node).channel(channel).unwrap().unwrap();
    (stored.active_full_ratchet_count, stored.latest_full_ratchet_count)
}

#[test]
fn channel_creation_confirms_both_ends() {
    let mut world = World::new(1);
    let alice = world.add_identity();
    let bob = world.add_identity();

    let uid = world.connect(alice, bob);
    assert!(world.all_steps_applied());

    let alice_channel = world.engine(alice).channel(&world.channel(alice, bob)).unwrap().unwrap();
    let bob_channel = world.engine(bob).channel(&world.channel(bob, alice)).unwrap().unwrap();
    assert!(alice_channel.confirmed);
    assert!(bob_channel.confirmed);
    assert_eq!(alice_channel.active_full_ratchet_count, 0);

    assert!(world.notified(
        alice,
        &Notification::ChannelConfirmed { channel: world.channel(alice, bob) }
    ));
    assert!(
        world.notified(bob, &Notification::ChannelConfirmed { channel: world.channel(bob, alice) })
    );

    // Both sides ran the same instance uid to a terminal state.
    for (node, owner) in [(alice, world.identity(alice)), (bob, world.identity(bob))] {
        let record = world.engine(node).instance(&owner, &uid).unwrap().unwrap();
        assert!(record.terminal);
        let state: ChannelCreationState = keyloom_proto::decode(&record.state).unwrap();
        assert!(matches!(state, ChannelCreationState::ChannelConfirmed { .. }));
    }

    let contact =
        world.engine(bob).contact(&world.identity(bob), &world.identity(alice)).unwrap().unwrap();
    assert_eq!(contact.devices, BTreeSet::from([world.device(alice)]));
}

#[test]
fn units_decrypt_out_of_order_exactly_once() {
    let mut world = World::new(2);
    let alice = world.add_identity();
    let bob = world.add_identity();
    world.connect(alice, bob);

    let outbound = world.channel(alice, bob);
    let inbound = world.channel(bob, alice);
    let units: Vec<_> = (0..6u8)
        .map(|i| world.engine(alice).encrypt_unit(&outbound, &[i]).unwrap())
        .collect();

    for (i, (key_id, ciphertext)) in units.iter().enumerate().rev() {
        let plaintext = world.engine(bob).deliver_encrypted_unit(&inbound, key_id, ciphertext);
        assert_eq!(plaintext.unwrap(), vec![u8::try_from(i).unwrap()]);
    }

    // INVARIANT: a consumed key is gone.
    let (key_id, ciphertext) = &units[3];
    let err = world.engine(bob).deliver_encrypted_unit(&inbound, key_id, ciphertext).unwrap_err();
    assert!(matches!(err, EngineError::Channel(ChannelError::NoMatchingKey { .. })));
    assert!(err.is_transient());
}

#[test]
fn full_ratchet_switches_both_ends_to_new_epoch() {
    let mut world = World::new(3);
    let alice = world.add_identity();
    let bob = world.add_identity();
    world.connect(alice, bob);

    let outbound = world.channel(alice, bob);
    let inbound = world.channel(bob, alice);

    // Two units still in flight under epoch 0.
    let early = world.engine(alice).encrypt_unit(&outbound, b"early").unwrap();
    let stale = world.engine(alice).encrypt_unit(&outbound, b"stale").unwrap();

    let (uid, dispatch) = world.engine(alice).request_full_ratchet(&outbound).unwrap();
    world.run(alice, dispatch.actions);
    assert!(world.all_steps_applied());

    for (node, channel) in [(alice, outbound), (bob, inbound)] {
        let stored = world.engine(node).channel(&channel).unwrap().unwrap();
        assert_eq!(stored.active_full_ratchet_count, 1);
        assert_eq!(stored.latest_full_ratchet_count, 1);
        assert!(world.notified(
            node,
            &Notification::FullRatchetCompleted { channel, full_ratchet_count: 1 }
        ));

        let record = world.engine(node).instance(&channel.owned_identity, &uid).unwrap().unwrap();
        let state: FullRatchetState = keyloom_proto::decode(&record.state).unwrap();
        assert!(matches!(state, FullRatchetState::FullRatchetDone { full_ratchet_count: 1 }));
    }

    // Old epoch still decrypts during grace; new epoch decrypts too.
    let (key_id, ciphertext) = &early;
    assert_eq!(
        world.engine(bob).deliver_encrypted_unit(&inbound, key_id, ciphertext).unwrap(),
        b"early"
    );
    let (key_id, ciphertext) = world.engine(alice).encrypt_unit(&outbound, b"fresh").unwrap();
    assert_eq!(
        world.engine(bob).deliver_encrypted_unit(&inbound, &key_id, &ciphertext).unwrap(),
        b"fresh"
    );

    world.env.advance(Duration::from_secs(world.config.expiring_key_grace_secs + 1));

    for node in [alice, bob] {
        let report = world.engine(node).run_maintenance().unwrap();
        assert!(report.expired_keys > 0);
        assert_eq!(report.deleted_provisions, 1);
    }

    let channel = world.engine(bob).channel(&inbound).unwrap().unwrap();
    let txn = Transaction::begin(world.engine(bob).storage());
    let epochs: Vec<u64> =
        channel.provisions(&txn).unwrap().iter().map(|p| p.full_ratchet_count).collect();
    assert_eq!(epochs, vec![1]);

    let (key_id, ciphertext) = &stale;
    assert!(matches!(
        world.engine(bob).deliver_encrypted_unit(&inbound, key_id, ciphertext),
        Err(EngineError::Channel(ChannelError::NoMatchingKey { .. }))
    ));
}

#[test]
fn full_ratchet_needs_an_existing_channel() {
    let mut world = World::new(4);
    let alice = world.add_identity();
    let bob = world.add_identity();

    let missing = world.channel(alice, bob);
    assert!(matches!(
        world.engine(alice).request_full_ratchet(&missing),
        Err(EngineError::Channel(ChannelError::UnknownChannel(id))) if id == missing
    ));
}

#[test]
fn full_ratchet_recovers_from_a_lost_reply() {
    let mut world = World::new(11);
    let alice = world.add_identity();
    let bob = world.add_identity();
    world.connect(alice, bob);

    let outbound = world.channel(alice, bob);
    let inbound = world.channel(bob, alice);

    // Bob answers the first attempt, but his reply never reaches Alice.
    let (_, dispatch) = world.engine(alice).request_full_ratchet(&outbound).unwrap();
    let proposal = single_send(dispatch.actions);
    let (_, answer) = world.deliver(&proposal);
    let lost = single_send(answer.actions);
    assert_eq!(lost.to_identity, world.identity(alice));
    assert_eq!(epochs(&world, bob, &inbound), (0, 1));
    assert_eq!(epochs(&world, alice, &outbound), (0, 0));

    // The retry skips past Bob's unused epoch.
    let (uid, dispatch) = world.engine(alice).request_full_ratchet(&outbound).unwrap();
    world.run(alice, dispatch.actions);
    assert!(world.all_steps_applied());

    for (node, channel) in [(alice, outbound), (bob, inbound)] {
        assert_eq!(epochs(&world, node, &channel), (2, 2));
        assert!(world.notified(
            node,
            &Notification::FullRatchetCompleted { channel, full_ratchet_count: 2 }
        ));
        let record = world.engine(node).instance(&channel.owned_identity, &uid).unwrap().unwrap();
        let state: FullRatchetState = keyloom_proto::decode(&record.state).unwrap();
        assert!(matches!(state, FullRatchetState::FullRatchetDone { full_ratchet_count: 2 }));
    }

    let (key_id, ciphertext) = world.engine(alice).encrypt_unit(&outbound, b"to bob").unwrap();
    assert_eq!(
        world.engine(bob).deliver_encrypted_unit(&inbound, &key_id, &ciphertext).unwrap(),
        b"to bob"
    );
    let (key_id, ciphertext) = world.engine(bob).encrypt_unit(&inbound, b"to alice").unwrap();
    assert_eq!(
        world.engine(alice).deliver_encrypted_unit(&outbound, &key_id, &ciphertext).unwrap(),
        b"to alice"
    );
}

#[test]
fn full_ratchet_recovers_from_a_lost_ack() {
    let mut world = World::new(12);
    let alice = world.add_identity();
    let bob = world.add_identity();
    world.connect(alice, bob);

    let outbound = world.channel(alice, bob);
    let inbound = world.channel(bob, alice);

    let (_, dispatch) = world.engine(alice).request_full_ratchet(&outbound).unwrap();
    let proposal = single_send(dispatch.actions);
    let (_, answer) = world.deliver(&proposal);
    let reply = single_send(answer.actions);
    let (_, activated) = world.deliver(&reply);
    let _lost_ack = single_send(activated.actions);

    assert_eq!(epochs(&world, alice, &outbound), (1, 1));
    assert_eq!(epochs(&world, bob, &inbound), (0, 1));

    // Alice already encrypts under epoch 1; Bob follows on the first such unit.
    let (key_id, ciphertext) = world.engine(alice).encrypt_unit(&outbound, b"epoch 1").unwrap();
    assert_eq!(
        world.engine(bob).deliver_encrypted_unit(&inbound, &key_id, &ciphertext).unwrap(),
        b"epoch 1"
    );
    assert_eq!(epochs(&world, bob, &inbound), (1, 1));

    let (key_id, ciphertext) = world.engine(bob).encrypt_unit(&inbound, b"reply").unwrap();
    assert_eq!(
        world.engine(alice).deliver_encrypted_unit(&outbound, &key_id, &ciphertext).unwrap(),
        b"reply"
    );

    // The next full ratchet runs normally.
    let (_, dispatch) = world.engine(alice).request_full_ratchet(&outbound).unwrap();
    world.run(alice, dispatch.actions);
    assert!(world.all_steps_applied());
    assert_eq!(epochs(&world, alice, &outbound), (2, 2));
    assert_eq!(epochs(&world, bob, &inbound), (2, 2));
}

#[test]
fn device_discovery_reaches_every_owned_device() {
    let mut world = World::new(5);
    let alice = world.add_identity();
    let alice_laptop = world.add_device(alice);
    let bob = world.add_identity();
    world.connect(alice, alice_laptop);

    let (uid, dispatch) = world
        .engine(alice)
        .start_device_discovery(world.identity(alice), world.identity(bob))
        .unwrap();
    world.run(alice, dispatch.actions);
    assert!(world.all_steps_applied());

    let expected = BTreeSet::from([world.device(bob)]);
    for node in [alice, alice_laptop] {
        let contact = world
            .engine(node)
            .contact(&world.identity(node), &world.identity(bob))
            .unwrap()
            .unwrap();
        assert_eq!(contact.devices, expected);
        assert!(world.notified(
            node,
            &Notification::DevicesDiscovered {
                owned_identity: world.identity(alice),
                identity: world.identity(bob),
                devices: vec![world.device(bob)],
            }
        ));

        let record = world.engine(node).instance(&world.identity(node), &uid).unwrap().unwrap();
        let state: DeviceDiscoveryState = keyloom_proto::decode(&record.state).unwrap();
        assert!(matches!(state, DeviceDiscoveryState::DevicesDiscovered { .. }));
    }
}

#[test]
fn device_list_from_another_identity_is_rejected() {
    let mut world = World::new(6);
    let alice = world.add_identity();
    let mallory = world.add_identity();
    world.connect(mallory, alice);

    let victim = world.add_identity();
    let update = DeviceDiscoveryMessage::OwnedDevicesUpdate {
        identity: world.identity(victim),
        devices: vec![DeviceUid::from_bytes([0x66; 32])],
    };
    let wire = WireProtocolMessage {
        protocol: DeviceDiscovery::ID,
        instance_uid: InstanceUid::from_bytes([0x77; 32]),
        kind: device_discovery::OWNED_DEVICES_UPDATE,
        body: update.encode_body().unwrap(),
    };

    let envelope = forge(&world, mallory, alice, &wire);
    let (_, dispatch) = world.deliver(&envelope);

    assert!(matches!(dispatch.outcome, DispatchOutcome::Cancelled(CancelReason::Violation(_))));
    assert!(
        world
            .engine(alice)
            .contact(&world.identity(alice), &world.identity(victim))
            .unwrap()
            .is_none()
    );
}

#[test]
fn wrong_confirmation_tag_cancels_responder() {
    let mut world = World::new(7);
    let alice = world.add_identity();
    let bob = world.add_identity();

    // Step through the handshake by hand, holding Alice's confirmation.
    let (uid, dispatch) = world
        .engine(alice)
        .start_channel_creation(world.identity(alice), world.identity(bob), world.device(bob))
        .unwrap();
    let ping = single_send(dispatch.actions);
    let (_, dispatch) = world.deliver(&ping);
    let k1 = single_send(dispatch.actions);
    let (_, dispatch) = world.deliver(&k1);
    let confirmation = single_send(dispatch.actions);

    let forged = WireProtocolMessage {
        protocol: ChannelCreation::ID,
        instance_uid: uid,
        kind: channel_creation::CONFIRMATION,
        body: ChannelCreationMessage::Confirmation { tag: [0; 32] }.encode_body().unwrap(),
    };
    let envelope = forge_sealed(&world, alice, bob, &forged);
    let (_, dispatch) = world.deliver(&envelope);

    assert_eq!(
        dispatch.outcome,
        DispatchOutcome::Cancelled(CancelReason::Violation("confirmation tag mismatch".into()))
    );
    let bob_channel = world.engine(bob).channel(&world.channel(bob, alice)).unwrap().unwrap();
    assert!(!bob_channel.confirmed);

    // The genuine confirmation arrives too late.
    let (_, dispatch) = world.deliver(&confirmation);
    assert_eq!(dispatch.outcome, DispatchOutcome::Discarded(DiscardReason::TerminalInstance));
    assert!(!world.engine(bob).channel(&world.channel(bob, alice)).unwrap().unwrap().confirmed);
}

#[test]
fn ping_claiming_another_sender_keeps_the_confirmed_channel() {
    let mut world = World::new(13);
    let alice = world.add_identity();
    let bob = world.add_identity();
    let mallory = world.add_identity();
    world.connect(alice, bob);

    let inbound = world.channel(bob, alice);
    let before = world.engine(alice).encrypt_unit(&world.channel(alice, bob), b"before").unwrap();

    // Mallory runs her own handshake with Bob but claims to be Alice.
    let (uid, dispatch) = world
        .engine(mallory)
        .start_channel_creation(world.identity(mallory), world.identity(bob), world.device(bob))
        .unwrap();
    let mut ping = single_send(dispatch.actions);
    ping.from_identity = world.identity(alice);
    ping.from_device = world.device(alice);

    let (_, dispatch) = world.deliver(&ping);
    let k1 = single_send(dispatch.actions);
    assert_eq!(k1.to_identity, world.identity(alice));
    assert!(world.engine(bob).channel(&inbound).unwrap().unwrap().confirmed);

    // Without Alice's identity key Mallory cannot produce the right tag.
    let confirmation = WireProtocolMessage {
        protocol: ChannelCreation::ID,
        instance_uid: uid,
        kind: channel_creation::CONFIRMATION,
        body: ChannelCreationMessage::Confirmation { tag: [0x4D; 32] }.encode_body().unwrap(),
    };
    let (_, dispatch) = world.deliver(&forge_sealed(&world, alice, bob, &confirmation));
    assert!(matches!(dispatch.outcome, DispatchOutcome::Cancelled(CancelReason::Violation(_))));

    let channel = world.engine(bob).channel(&inbound).unwrap().unwrap();
    assert!(channel.confirmed);
    let (key_id, ciphertext) = &before;
    assert_eq!(
        world.engine(bob).deliver_encrypted_unit(&inbound, key_id, ciphertext).unwrap(),
        b"before"
    );
}

#[test]
fn repeated_handshake_replaces_the_channel_once_confirmed() {
    let mut world = World::new(14);
    let alice = world.add_identity();
    let bob = world.add_identity();
    world.connect(alice, bob);

    let outbound = world.channel(alice, bob);
    let inbound = world.channel(bob, alice);
    let old = world.engine(alice).encrypt_unit(&outbound, b"old").unwrap();

    world.connect(alice, bob);
    assert!(world.all_steps_applied());
    assert!(world.engine(bob).channel(&inbound).unwrap().unwrap().confirmed);

    let (key_id, ciphertext) = world.engine(alice).encrypt_unit(&outbound, b"new").unwrap();
    assert_eq!(
        world.engine(bob).deliver_encrypted_unit(&inbound, &key_id, &ciphertext).unwrap(),
        b"new"
    );
    let (key_id, ciphertext) = &old;
    assert!(matches!(
        world.engine(bob).deliver_encrypted_unit(&inbound, key_id, ciphertext),
        Err(EngineError::Channel(ChannelError::NoMatchingKey { .. }))
    ));
}

#[test]
fn crash_after_receipt_is_recovered_by_replay() {
    let mut world = World::new(8);
    let alice = world.add_identity();
    let bob = world.add_identity();

    let (_, dispatch) = world
        .engine(alice)
        .start_channel_creation(world.identity(alice), world.identity(bob), world.device(bob))
        .unwrap();
    let ping = single_send(dispatch.actions);

    // The inbox write commits, the step's commit does not.
    world.engine(bob).storage().crash_after(1);
    let err = world.engine(bob).receive_envelope(&ping).unwrap_err();
    assert!(err.is_transient());

    let storage = &world.engine(bob).storage().inner;
    assert_eq!(storage.len(Table::Inbox), 1);
    assert_eq!(storage.len(Table::Channels), 0);

    let replayed = world.engine(bob).replay_inbox(&world.identity(bob)).unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(world.engine(bob).storage().inner.len(Table::Inbox), 0);

    let actions = replayed.into_iter().flat_map(|dispatch| dispatch.actions).collect();
    world.run(bob, actions);

    assert!(world.all_steps_applied());
    assert!(world.engine(alice).channel(&world.channel(alice, bob)).unwrap().unwrap().confirmed);
    assert!(world.engine(bob).channel(&world.channel(bob, alice)).unwrap().unwrap().confirmed);
}

#[test]
fn undecodable_content_still_spends_the_key() {
    let mut world = World::new(9);
    let alice = world.add_identity();
    let bob = world.add_identity();
    world.connect(alice, bob);

    let (key_id, ciphertext) =
        world.engine(alice).encrypt_unit(&world.channel(alice, bob), b"not a message").unwrap();
    let envelope = Envelope {
        from_identity: world.identity(alice),
        from_device: world.device(alice),
        to_identity: world.identity(bob),
        to_device: world.device(bob),
        body: EnvelopeBody::Channel { key_id, ciphertext },
    };

    let (_, dispatch) = world.deliver(&envelope);
    assert_eq!(dispatch.outcome, DispatchOutcome::Discarded(DiscardReason::Undecodable));

    assert!(matches!(
        world.engine(bob).receive_envelope(&envelope),
        Err(EngineError::Channel(ChannelError::NoMatchingKey { .. }))
    ));
}

#[test]
fn envelopes_for_other_devices_are_refused() {
    let mut world = World::new(10);
    let alice = world.add_identity();
    let bob = world.add_identity();

    let (_, dispatch) = world
        .engine(alice)
        .start_channel_creation(world.identity(alice), world.identity(bob), world.device(bob))
        .unwrap();
    let mut ping = single_send(dispatch.actions);

    let elsewhere = DeviceUid::from_bytes([0x42; 32]);
    ping.to_device = elsewhere;
    assert!(matches!(
        world.engine(bob).receive_envelope(&ping),
        Err(EngineError::MisroutedEnvelope { device }) if device == elsewhere
    ));

    ping.to_identity = IdentityId::from_bytes([0x43; 32]);
    assert!(matches!(
        world.engine(bob).receive_envelope(&ping),
        Err(EngineError::UnknownIdentity(_))
    ));
}
