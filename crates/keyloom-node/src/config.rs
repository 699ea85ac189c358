//! Node configuration.

use std::{path::PathBuf, time::Duration};

use keyloom_core::EngineConfig;

/// Runtime configuration for a [`crate::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Engine tuning (key thresholds, grace period)
    pub engine: EngineConfig,
    /// Redb database file. `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    /// Pause between maintenance passes
    pub maintenance_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            db_path: None,
            maintenance_interval: Duration::from_secs(10 * 60),
        }
    }
}
