//! Generic protocol state machines.
//!
//! A protocol is a finite state machine whose transitions ("steps") are
//! triggered by messages. Each protocol declares its steps in a static table;
//! the [`Catalog`] indexes every table by `(protocol, state, message)` and
//! the [`Dispatcher`] uses that index to route each incoming message to at
//! most one step.
//!
//! ```text
//! ProtocolMessage
//!       │
//!       ▼
//! Dispatcher ── unknown protocol / terminal / undecodable / no step ──▶ Discarded
//!       │
//!       ├── wrong reception kind ──────────────────────────────────────▶ Cancelled
//!       ▼
//! step.execute(state, message, ctx)
//!       │
//!       ├── Ok(Some(next)) ──▶ Transitioned (state saved)
//!       ├── Ok(None) ────────▶ Unchanged
//!       ├── Violation ───────▶ Cancelled (step writes rolled back)
//!       └── other error ─────▶ Err (nothing committed)
//! ```
//!
//! # Invariants
//!
//! - At most one step matches any `(protocol, state, message kind)` triple;
//!   the catalog refuses ambiguous tables at registration
//! - `Cancelled` is terminal: no step may start from it
//! - A step's effects are only released after its transaction commits

mod catalog;
pub mod definitions;
mod dispatcher;
mod error;
mod instance;
mod step;

use serde::{Deserialize, Serialize};

pub use catalog::{Catalog, CatalogStep, ProtocolRunner, Registered, StepTransition};
pub use dispatcher::{CancelReason, DiscardReason, Dispatch, DispatchOutcome, Dispatcher};
pub use error::{CatalogError, StepError};
pub use instance::InstanceRecord;
pub use step::{
    Destination, Protocol, ProtocolMessageSet, ProtocolState, StepContext, StepDescriptor,
};

/// Identifier of a state within one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(pub u16);

impl StateId {
    /// State of an instance that has not processed any message yet.
    pub const INITIAL: Self = Self(0);

    /// Terminal state after a protocol violation.
    pub const CANCELLED: Self = Self(1);
}
