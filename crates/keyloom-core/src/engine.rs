//! Engine facade.
//!
//! The [`Engine`] ties storage, environment, configuration and the protocol
//! catalog together. Every public operation runs in its own transaction and
//! commits before returning; effects come back as
//! [`EngineAction`](crate::action::EngineAction)s for the
//! caller to execute.
//!
//! # Receive Path
//!
//! ```text
//! Envelope
//!    │ decrypt (channel) / open (sealed)
//!    ▼
//! txn 1: consume key + write inbox entry ── commit
//!    │
//!    ▼
//! txn 2: dispatch step + delete inbox entry ── commit ──▶ EngineActions
//! ```
//!
//! A crash between the two commits leaves the message in the inbox, where
//! [`Engine::replay_inbox`] picks it up. The consumed key is never needed
//! again because the plaintext is already stored.

use keyloom_crypto::{KeyId, open_sealed};
use keyloom_proto::{
    DeviceUid, Envelope, EnvelopeBody, IdentityId, InstanceUid, MessageUid, ProtocolMessage,
    ReceptionChannel, WireProtocolMessage,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, ChannelId},
    config::EngineConfig,
    env::{EntropyPrng, Environment},
    error::EngineError,
    identity::{Contact, OwnedIdentity},
    inbox::InboxEntry,
    ledger::key_material,
    protocol::{
        Catalog, DiscardReason, Dispatch, DispatchOutcome, Dispatcher, InstanceRecord, Protocol,
        ProtocolMessageSet,
        definitions::{
            ChannelCreation, ChannelCreationMessage, DeviceDiscovery, DeviceDiscoveryMessage,
            FullRatchet, FullRatchetMessage,
        },
    },
    storage::{Storage, Transaction},
};

/// What a maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired key materials deleted
    pub expired_keys: usize,
    /// Empty provisions deleted
    pub deleted_provisions: usize,
}

/// Sans-IO messaging engine.
pub struct Engine<S: Storage, E: Environment> {
    storage: S,
    env: E,
    config: EngineConfig,
    catalog: Catalog,
}

impl<S: Storage, E: Environment> Engine<S, E> {
    /// Engine with the built-in protocol catalog.
    pub fn new(storage: S, env: E, config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self::with_catalog(storage, env, config, Catalog::builtin()?))
    }

    /// Engine with a custom catalog.
    pub fn with_catalog(storage: S, env: E, config: EngineConfig, catalog: Catalog) -> Self {
        Self { storage, env, config, catalog }
    }

    /// Storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Protocol catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn begin(&self) -> Transaction<'_> {
        Transaction::begin(&self.storage)
    }

    fn require_owned(
        &self,
        txn: &Transaction<'_>,
        identity: &IdentityId,
    ) -> Result<OwnedIdentity, EngineError> {
        OwnedIdentity::load(txn, identity)?.ok_or(EngineError::UnknownIdentity(*identity))
    }

    /// Generate and store a new identity with one device.
    pub fn create_owned_identity(&self) -> Result<OwnedIdentity, EngineError> {
        let owned = OwnedIdentity::generate(&mut EntropyPrng::new(&self.env));
        self.register_owned_identity(&owned)?;
        Ok(owned)
    }

    /// Store an identity created elsewhere (another device of it).
    pub fn register_owned_identity(&self, owned: &OwnedIdentity) -> Result<(), EngineError> {
        let mut txn = self.begin();
        owned.save(&mut txn)?;
        txn.commit()?;

        info!(identity = %owned.identity, device = %owned.current_device, "owned identity added");
        Ok(())
    }

    /// Load an owned identity.
    pub fn owned_identity(
        &self,
        identity: &IdentityId,
    ) -> Result<Option<OwnedIdentity>, EngineError> {
        Ok(OwnedIdentity::load(&self.begin(), identity)?)
    }

    /// Load a channel.
    pub fn channel(&self, id: &ChannelId) -> Result<Option<Channel>, EngineError> {
        Ok(Channel::load(&self.begin(), id)?)
    }

    /// Load a protocol instance.
    pub fn instance(
        &self,
        owned_identity: &IdentityId,
        instance_uid: &InstanceUid,
    ) -> Result<Option<InstanceRecord>, EngineError> {
        Ok(InstanceRecord::load(&self.begin(), owned_identity, instance_uid)?)
    }

    /// Load a contact.
    pub fn contact(
        &self,
        owned_identity: &IdentityId,
        contact_identity: &IdentityId,
    ) -> Result<Option<Contact>, EngineError> {
        Ok(Contact::load(&self.begin(), owned_identity, contact_identity)?)
    }

    /// Encrypt an application unit for a channel with the next send key of
    /// its active epoch.
    ///
    /// # Errors
    ///
    /// - `Channel(UnknownChannel)` if the channel does not exist
    pub fn encrypt_unit(
        &self,
        channel_id: &ChannelId,
        plaintext: &[u8],
    ) -> Result<(KeyId, Vec<u8>), EngineError> {
        let mut txn = self.begin();
        let channel = Channel::require(&txn, channel_id)?;
        let sealed =
            channel.encrypt(&mut txn, plaintext, &mut EntropyPrng::new(&self.env), &self.config)?;
        txn.commit()?;
        Ok(sealed)
    }

    /// Decrypt one unit received on a channel and commit the key's
    /// consumption.
    ///
    /// # Errors
    ///
    /// - `Channel(NoMatchingKey)` if no usable key has this id (transient)
    /// - `Channel(UnknownChannel)` if the channel does not exist
    /// - `Channel(Crypto)` if the unit fails to authenticate
    pub fn deliver_encrypted_unit(
        &self,
        channel_id: &ChannelId,
        key_id: &KeyId,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let mut txn = self.begin();
        let plaintext = self.decrypt_in(&mut txn, channel_id, key_id, ciphertext)?;
        txn.commit()?;
        Ok(plaintext)
    }

    fn decrypt_in(
        &self,
        txn: &mut Transaction<'_>,
        channel_id: &ChannelId,
        key_id: &KeyId,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let mut channel = Channel::require(txn, channel_id)?;
        let now = self.env.wall_clock_secs();
        Ok(channel.receive(txn, key_id, ciphertext, now, &self.config)?)
    }

    /// Open an envelope from the transport and dispatch what it carries.
    ///
    /// # Errors
    ///
    /// - `UnknownIdentity` / `MisroutedEnvelope` if the envelope is not for
    ///   this engine
    /// - `Channel` or `Crypto` if it cannot be opened; nothing is consumed
    /// - dispatch errors as for [`Engine::submit_protocol_message`]
    pub fn receive_envelope(&self, envelope: &Envelope) -> Result<Dispatch, EngineError> {
        let mut txn = self.begin();
        let owned = self.require_owned(&txn, &envelope.to_identity)?;
        if owned.current_device != envelope.to_device {
            return Err(EngineError::MisroutedEnvelope { device: envelope.to_device });
        }

        let remote_identity = envelope.from_identity;
        let remote_device = envelope.from_device;
        let (plaintext, reception) = match &envelope.body {
            EnvelopeBody::Channel { key_id, ciphertext } => {
                let channel_id =
                    ChannelId { owned_identity: owned.identity, remote_identity, remote_device };
                let plaintext = self.decrypt_in(&mut txn, &channel_id, key_id, ciphertext)?;
                (plaintext, ReceptionChannel::Direct { remote_identity, remote_device })
            },
            EnvelopeBody::Sealed { sealed } => {
                let plaintext = open_sealed(owned.key_pair(), sealed)?;
                (plaintext, ReceptionChannel::Asymmetric { remote_identity, remote_device })
            },
        };

        let Ok(wire) = WireProtocolMessage::from_bytes(&plaintext) else {
            // The key is spent either way.
            txn.commit()?;
            debug!(from = %remote_identity, "discarding undecodable envelope content");
            return Ok(Dispatch {
                outcome: DispatchOutcome::Discarded(DiscardReason::Undecodable),
                actions: Vec::new(),
            });
        };

        let entry = self.new_inbox_entry(wire.into_received(owned.identity, reception));
        entry.save(&mut txn)?;
        txn.commit()?;

        self.process(&owned, &entry)
    }

    /// Queue a protocol message and dispatch it.
    ///
    /// The message is persisted in the inbox first, then processed in a
    /// second transaction that also removes it.
    pub fn submit_protocol_message(
        &self,
        message: ProtocolMessage,
    ) -> Result<Dispatch, EngineError> {
        let mut txn = self.begin();
        let owned = self.require_owned(&txn, &message.owned_identity)?;

        let entry = self.new_inbox_entry(message);
        entry.save(&mut txn)?;
        txn.commit()?;

        self.process(&owned, &entry)
    }

    fn new_inbox_entry(&self, message: ProtocolMessage) -> InboxEntry {
        InboxEntry {
            message_uid: MessageUid::from_bytes(self.env.random_32()),
            received_at: self.env.wall_clock_secs(),
            message,
        }
    }

    /// Dispatch one inbox entry and delete it in the same commit.
    ///
    /// An entry whose dispatch fails permanently is dropped so it cannot
    /// block the inbox; transient failures leave it for replay.
    fn process(&self, owned: &OwnedIdentity, entry: &InboxEntry) -> Result<Dispatch, EngineError> {
        let dispatcher = Dispatcher::new(&self.catalog, &self.config);
        let now = self.env.wall_clock_secs();

        let mut prng = EntropyPrng::new(&self.env);

        let mut txn = self.begin();
        let result = dispatcher.dispatch(&mut txn, owned, &mut prng, now, &entry.message);

        match result {
            Ok(dispatch) => {
                entry.delete(&mut txn);
                txn.commit()?;
                Ok(dispatch)
            },
            Err(err) if err.is_transient() => Err(err.into()),
            Err(err) => {
                warn!(
                    instance = ?entry.message.instance_uid,
                    error = %err,
                    "dropping message after permanent step failure"
                );
                drop(txn);
                let mut cleanup = self.begin();
                entry.delete(&mut cleanup);
                cleanup.commit()?;
                Err(err.into())
            },
        }
    }

    /// Process every message left in an identity's inbox, oldest first.
    ///
    /// Stops at the first failure. The failure is returned only when no
    /// earlier entry committed; otherwise the committed dispatches are
    /// returned (their actions must still run) and the rest of the inbox
    /// waits for the next replay.
    pub fn replay_inbox(&self, owned_identity: &IdentityId) -> Result<Vec<Dispatch>, EngineError> {
        let txn = self.begin();
        let owned = self.require_owned(&txn, owned_identity)?;
        let entries = InboxEntry::load_for_identity(&txn, owned_identity)?;
        drop(txn);

        if !entries.is_empty() {
            info!(identity = %owned_identity, pending = entries.len(), "replaying inbox");
        }

        let mut dispatches = Vec::with_capacity(entries.len());
        for entry in &entries {
            match self.process(&owned, entry) {
                Ok(dispatch) => dispatches.push(dispatch),
                Err(err) if dispatches.is_empty() => return Err(err),
                Err(err) => {
                    warn!(
                        identity = %owned_identity,
                        replayed = dispatches.len(),
                        error = %err,
                        "inbox replay interrupted"
                    );
                    break;
                },
            }
        }
        Ok(dispatches)
    }

    /// Start a protocol instance from a local message. Returns the new
    /// instance uid with the dispatch of the first step.
    pub fn start_protocol<P: Protocol>(
        &self,
        owned_identity: IdentityId,
        message: &P::Message,
    ) -> Result<(InstanceUid, Dispatch), EngineError> {
        let instance_uid = InstanceUid::from_bytes(self.env.random_32());
        let dispatch = self.submit_protocol_message(ProtocolMessage {
            owned_identity,
            protocol: P::ID,
            instance_uid,
            kind: message.kind(),
            body: message.encode_body()?,
            reception: ReceptionChannel::Local,
        })?;
        Ok((instance_uid, dispatch))
    }

    /// Open a channel to a remote device.
    pub fn start_channel_creation(
        &self,
        owned_identity: IdentityId,
        remote_identity: IdentityId,
        remote_device: DeviceUid,
    ) -> Result<(InstanceUid, Dispatch), EngineError> {
        self.start_protocol::<ChannelCreation>(
            owned_identity,
            &ChannelCreationMessage::Start { remote_identity, remote_device },
        )
    }

    /// Re-key a confirmed channel.
    ///
    /// # Errors
    ///
    /// - `Channel(UnknownChannel)` if the channel does not exist
    pub fn request_full_ratchet(
        &self,
        channel_id: &ChannelId,
    ) -> Result<(InstanceUid, Dispatch), EngineError> {
        Channel::require(&self.begin(), channel_id)?;
        self.start_protocol::<FullRatchet>(
            channel_id.owned_identity,
            &FullRatchetMessage::Initiate {
                remote_identity: channel_id.remote_identity,
                remote_device: channel_id.remote_device,
            },
        )
    }

    /// Ask the server for the devices of `identity`.
    pub fn start_device_discovery(
        &self,
        owned_identity: IdentityId,
        identity: IdentityId,
    ) -> Result<(InstanceUid, Dispatch), EngineError> {
        self.start_protocol::<DeviceDiscovery>(
            owned_identity,
            &DeviceDiscoveryMessage::Start { identity },
        )
    }

    /// Delete expired keys, then every provision left without keys.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport, EngineError> {
        let now = self.env.wall_clock_secs();
        let mut txn = self.begin();

        let expired_keys = key_material::delete_expired(&mut txn, now)?;
        // Every channel: an epoch can also empty out by its keys being used.
        let mut deleted_provisions = 0;
        for channel in Channel::load_all(&txn)? {
            deleted_provisions += channel.delete_empty_provisions(&mut txn)?.len();
        }
        txn.commit()?;

        let report = MaintenanceReport { expired_keys, deleted_provisions };
        if report != MaintenanceReport::default() {
            info!(expired_keys, deleted_provisions, "maintenance pass");
        }
        Ok(report)
    }
}
