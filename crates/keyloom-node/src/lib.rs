//! Keyloom node runtime.
//!
//! Production glue around [`keyloom_core`]'s Sans-IO engine: it executes the
//! actions the engine returns, serializes work per owned identity, runs
//! background flows and provides durable storage.
//!
//! # Components
//!
//! - [`Node`]: engine plus transport, one lane per owned identity
//! - [`Flow`]: cancellable background activity (mailbox, maintenance)
//! - [`Transport`] / [`MemoryNetwork`]: envelope delivery and server queries
//! - [`storage::RedbStorage`]: durable tables, [`storage::ChaoticStorage`]:
//!   fault injection
//! - [`SystemEnv`]: real clocks and OS randomness

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod error;
mod flow;
mod lanes;
mod node;
pub mod storage;
mod system_env;
mod transport;

pub use config::NodeConfig;
pub use error::NodeError;
pub use flow::{CancelToken, Flow};
pub use lanes::{ExclusiveGuard, LaneGuard, Lanes};
pub use node::Node;
pub use system_env::SystemEnv;
pub use transport::{MemoryNetwork, Transport};
