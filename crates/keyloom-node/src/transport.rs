//! Delivery of envelopes and server queries.
//!
//! The engine never talks to the network; [`crate::Node`] hands the
//! `Send` and `Query` actions it produces to a [`Transport`].
//! [`MemoryNetwork`] routes them between nodes of the same process and
//! answers queries from its own device directory.

#![allow(clippy::disallowed_types, reason = "Short critical sections, never held across await")]

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex},
};

use keyloom_proto::{DeviceUid, Envelope, IdentityId, QueryKind, QueryResponse, ServerQuery};
use tokio::sync::mpsc;
use tracing::trace;

use crate::NodeError;

/// Outbound side of the node.
pub trait Transport: Send + Sync + 'static {
    /// Deliver an envelope to the device it is addressed to.
    fn send(&self, envelope: Envelope) -> impl Future<Output = Result<(), NodeError>> + Send;

    /// Ask the server and wait for its answer.
    fn query(
        &self,
        query: &ServerQuery,
    ) -> impl Future<Output = Result<QueryResponse, NodeError>> + Send;
}

/// In-process network: one mailbox per registered device.
///
/// Clones share the same mailboxes and directory.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    mailboxes: HashMap<(IdentityId, DeviceUid), mpsc::UnboundedSender<Envelope>>,
    /// Devices per identity, in registration order
    directory: BTreeMap<IdentityId, Vec<DeviceUid>>,
    delivered: usize,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return its mailbox.
    ///
    /// Registering the same device again replaces the previous mailbox.
    #[allow(clippy::expect_used)]
    pub fn register(
        &self,
        identity: IdentityId,
        device: DeviceUid,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().expect("Mutex poisoned");
        state.mailboxes.insert((identity, device), tx);
        let devices = state.directory.entry(identity).or_default();
        if !devices.contains(&device) {
            devices.push(device);
        }
        rx
    }

    /// Devices registered for `identity`.
    #[allow(clippy::expect_used)]
    pub fn devices(&self, identity: &IdentityId) -> Vec<DeviceUid> {
        let state = self.state.lock().expect("Mutex poisoned");
        state.directory.get(identity).cloned().unwrap_or_default()
    }

    /// Envelopes accepted so far.
    #[allow(clippy::expect_used)]
    pub fn delivered(&self) -> usize {
        self.state.lock().expect("Mutex poisoned").delivered
    }

    #[allow(clippy::expect_used)]
    fn route(&self, envelope: Envelope) -> Result<(), NodeError> {
        let mut state = self.state.lock().expect("Mutex poisoned");
        let key = (envelope.to_identity, envelope.to_device);
        let mailbox = state.mailboxes.get(&key).ok_or(NodeError::Unreachable {
            identity: envelope.to_identity,
            device: envelope.to_device,
        })?;

        trace!(to = %envelope.to_identity, device = %envelope.to_device, "routing envelope");
        mailbox.send(envelope).map_err(|_| NodeError::Transport("mailbox closed".to_string()))?;
        state.delivered += 1;
        Ok(())
    }
}

impl Transport for MemoryNetwork {
    fn send(&self, envelope: Envelope) -> impl Future<Output = Result<(), NodeError>> + Send {
        std::future::ready(self.route(envelope))
    }

    fn query(
        &self,
        query: &ServerQuery,
    ) -> impl Future<Output = Result<QueryResponse, NodeError>> + Send {
        let response = match &query.query {
            QueryKind::DeviceDiscovery { identity } => {
                QueryResponse::DeviceDiscovery { devices: self.devices(identity) }
            },
        };
        std::future::ready(Ok(response))
    }
}
