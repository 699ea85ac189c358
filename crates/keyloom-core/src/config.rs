//! Engine configuration.

use keyloom_crypto::SuiteVersion;

/// Tunables shared by the ledger, channels and protocol steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Minimum number of not-yet-expiring receive keys an active provision
    /// keeps ready. A fresh provision is filled to twice this value.
    pub reprovisioning_threshold: u64,

    /// How long keys of a superseded epoch stay usable after a full ratchet.
    pub expiring_key_grace_secs: u64,

    /// Suite used for new provisions.
    pub suite: SuiteVersion,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reprovisioning_threshold: 10,
            expiring_key_grace_secs: 3 * 24 * 60 * 60,
            suite: SuiteVersion::V1,
        }
    }
}

impl EngineConfig {
    /// Number of keys a provision is topped up to.
    ///
    /// `2 × threshold` right after creation (nothing derived yet), `threshold`
    /// on replenishment.
    pub fn refill_target(&self, first_fill: bool) -> u64 {
        if first_fill {
            self.reprovisioning_threshold.saturating_mul(2)
        } else {
            self.reprovisioning_threshold
        }
    }
}
