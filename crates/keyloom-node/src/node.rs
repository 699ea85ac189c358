//! Runtime that executes engine actions.
//!
//! [`Node`] owns an [`Engine`] and a [`Transport`]. Every engine call for an
//! owned identity runs inside that identity's lane, together with the
//! actions it returns: envelopes go out through the transport, server
//! queries are answered and fed back, loopback messages are submitted again,
//! and notifications are broadcast to subscribers.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use keyloom_core::{
    ChannelId, Dispatch, Engine, EngineAction, Environment, MaintenanceReport, Notification,
    OwnedIdentity, Storage,
};
use keyloom_proto::{DeviceUid, Envelope, IdentityId, InstanceUid, ProtocolMessage};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    NodeError,
    flow::{CancelToken, Flow},
    lanes::Lanes,
    transport::Transport,
};

/// Capacity of the notification broadcast. Slow subscribers lag, they never
/// block the node.
const NOTIFICATION_CAPACITY: usize = 256;

/// Engine plus transport, with per-identity serialization.
pub struct Node<S: Storage, E: Environment, T: Transport> {
    engine: Engine<S, E>,
    transport: T,
    lanes: Lanes,
    notifications: broadcast::Sender<Notification>,
}

impl<S, E, T> Node<S, E, T>
where
    S: Storage + 'static,
    E: Environment,
    T: Transport,
{
    /// Wrap an engine.
    pub fn new(engine: Engine<S, E>, transport: T) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { engine, transport, lanes: Lanes::new(), notifications }
    }

    /// The wrapped engine, for reads.
    pub fn engine(&self) -> &Engine<S, E> {
        &self.engine
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Receive every notification emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Generate and store a new identity.
    pub fn create_owned_identity(&self) -> Result<OwnedIdentity, NodeError> {
        Ok(self.engine.create_owned_identity()?)
    }

    /// Store an identity created on another device.
    pub async fn register_owned_identity(&self, owned: &OwnedIdentity) -> Result<(), NodeError> {
        let _lane = self.lanes.acquire(owned.identity).await;
        Ok(self.engine.register_owned_identity(owned)?)
    }

    /// Decrypt and dispatch an envelope addressed to one of our devices.
    pub async fn receive(&self, envelope: &Envelope) -> Result<Dispatch, NodeError> {
        let _lane = self.lanes.acquire(envelope.to_identity).await;
        let dispatch = self.engine.receive_envelope(envelope)?;
        self.execute(dispatch.actions.clone()).await;
        Ok(dispatch)
    }

    /// Start a channel handshake with one device of a contact.
    pub async fn start_channel_creation(
        &self,
        owned_identity: IdentityId,
        remote_identity: IdentityId,
        remote_device: DeviceUid,
    ) -> Result<InstanceUid, NodeError> {
        let _lane = self.lanes.acquire(owned_identity).await;
        let (uid, dispatch) =
            self.engine.start_channel_creation(owned_identity, remote_identity, remote_device)?;
        self.execute(dispatch.actions).await;
        Ok(uid)
    }

    /// Rekey an existing channel.
    pub async fn request_full_ratchet(
        &self,
        channel_id: &ChannelId,
    ) -> Result<InstanceUid, NodeError> {
        let _lane = self.lanes.acquire(channel_id.owned_identity).await;
        let (uid, dispatch) = self.engine.request_full_ratchet(channel_id)?;
        self.execute(dispatch.actions).await;
        Ok(uid)
    }

    /// Refresh the device list of `identity`.
    pub async fn start_device_discovery(
        &self,
        owned_identity: IdentityId,
        identity: IdentityId,
    ) -> Result<InstanceUid, NodeError> {
        let _lane = self.lanes.acquire(owned_identity).await;
        let (uid, dispatch) = self.engine.start_device_discovery(owned_identity, identity)?;
        self.execute(dispatch.actions).await;
        Ok(uid)
    }

    /// Process messages left in the inbox by an earlier failure.
    ///
    /// Returns the number of messages dispatched.
    pub async fn replay_inbox(&self, owned_identity: IdentityId) -> Result<usize, NodeError> {
        let _lane = self.lanes.acquire(owned_identity).await;
        let dispatches = self.engine.replay_inbox(&owned_identity)?;
        let count = dispatches.len();
        for dispatch in dispatches {
            self.execute(dispatch.actions).await;
        }
        Ok(count)
    }

    /// Delete expired keys and empty provisions across all identities.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, NodeError> {
        let _all = self.lanes.exclusive().await;
        Ok(self.engine.run_maintenance()?)
    }

    /// Carry out post-commit actions until none are left.
    ///
    /// Runs inside the caller's lane. Failures are logged and skipped: the
    /// step that produced the action has already committed, and a message
    /// the engine could not process stays in its inbox for a replay.
    async fn execute(&self, actions: Vec<EngineAction>) {
        let mut queue: VecDeque<EngineAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                EngineAction::Send(envelope) => {
                    let to = envelope.to_identity;
                    if let Err(err) = self.transport.send(envelope).await {
                        warn!(%to, error = %err, "envelope not delivered");
                    }
                },
                EngineAction::Query(query) => {
                    let answer = match self.transport.query(&query).await {
                        Ok(response) => query.respond(&response),
                        Err(err) => {
                            warn!(protocol = ?query.protocol, error = %err, "server query failed");
                            continue;
                        },
                    };
                    match answer {
                        Ok(message) => queue.extend(self.submit(message)),
                        Err(err) => warn!(error = %err, "server answer not encodable"),
                    }
                },
                EngineAction::Loopback(message) => queue.extend(self.submit(message)),
                EngineAction::Notify(notification) => {
                    info!(?notification, "notification");
                    // No subscribers is fine.
                    let _ = self.notifications.send(notification);
                },
            }
        }
    }

    fn submit(&self, message: ProtocolMessage) -> Vec<EngineAction> {
        match self.engine.submit_protocol_message(message) {
            Ok(dispatch) => dispatch.actions,
            Err(err) => {
                warn!(error = %err, transient = err.is_transient(), "local message failed");
                Vec::new()
            },
        }
    }

    /// Process envelopes from `mailbox` until cancelled or the mailbox closes.
    ///
    /// The flow's result is the number of envelopes dispatched. An envelope
    /// that fails is logged and dropped; one that does not decrypt yet never
    /// reaches the inbox, so only the sender can deliver it again. A failure
    /// after the inbox write leaves the message there for
    /// [`Node::replay_inbox`].
    pub fn spawn_mailbox(
        self: &Arc<Self>,
        mut mailbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Flow<usize> {
        let node = Arc::clone(self);
        Flow::spawn("mailbox", move |mut token: CancelToken| async move {
            let mut dispatched = 0;
            loop {
                let envelope = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    envelope = mailbox.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                match node.receive(&envelope).await {
                    Ok(_) => dispatched += 1,
                    Err(err) if err.is_transient() => {
                        warn!(from = %envelope.from_identity, error = %err, "envelope dropped");
                    },
                    Err(err) => {
                        debug!(from = %envelope.from_identity, error = %err, "envelope rejected");
                    },
                }
            }
            Ok(dispatched)
        })
    }

    /// Run a maintenance pass every `interval` until cancelled.
    ///
    /// The flow's result is the number of passes that completed.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> Flow<usize> {
        let node = Arc::clone(self);
        Flow::spawn("maintenance", move |mut token: CancelToken| async move {
            let mut passes = 0;
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = node.engine.env().sleep(interval) => {},
                }

                match node.run_maintenance().await {
                    Ok(_) => passes += 1,
                    Err(err) => warn!(error = %err, "maintenance pass failed"),
                }
            }
            Ok(passes)
        })
    }
}
