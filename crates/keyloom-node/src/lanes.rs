//! Per-identity execution lanes.
//!
//! Engine transactions buffer their writes and commit a batch at the end
//! without conflict detection, so two steps touching the same identity must
//! never overlap. Every piece of work for an owned identity runs while
//! holding that identity's lane; different identities proceed in parallel.
//!
//! Maintenance touches every channel at once. It takes the exclusive side of
//! a gate that every lane holds shared, so it runs only while no lane is busy.

use std::{collections::HashMap, sync::Arc};

use keyloom_proto::IdentityId;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Lane registry.
#[derive(Default)]
pub struct Lanes {
    gate: Arc<RwLock<()>>,
    lanes: Mutex<HashMap<IdentityId, Arc<Mutex<()>>>>,
}

/// Held while work for one identity runs.
pub struct LaneGuard {
    _lane: OwnedMutexGuard<()>,
    _gate: OwnedRwLockReadGuard<()>,
}

/// Held while work spanning every identity runs.
pub struct ExclusiveGuard {
    _gate: OwnedRwLockWriteGuard<()>,
}

impl Lanes {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lane of `identity`.
    ///
    /// Lanes are created on first use. Envelopes name their recipient before
    /// the engine checks it is owned, so any identity can get a lane. A lane
    /// that nobody holds or waits for is dropped on the next acquire, which
    /// keeps the registry no larger than the set of busy identities.
    pub async fn acquire(&self, identity: IdentityId) -> LaneGuard {
        let gate = Arc::clone(&self.gate).read_owned().await;
        let lane = {
            let mut lanes = self.lanes.lock().await;
            lanes.retain(|id, lane| *id == identity || Arc::strong_count(lane) > 1);
            Arc::clone(lanes.entry(identity).or_default())
        };
        LaneGuard { _lane: lane.lock_owned().await, _gate: gate }
    }

    /// Wait until no lane is held and block new ones until the guard drops.
    pub async fn exclusive(&self) -> ExclusiveGuard {
        ExclusiveGuard { _gate: Arc::clone(&self.gate).write_owned().await }
    }

    /// Number of lanes currently tracked.
    pub async fn len(&self) -> usize {
        self.lanes.lock().await.len()
    }

    /// True if no lane is tracked.
    pub async fn is_empty(&self) -> bool {
        self.lanes.lock().await.is_empty()
    }
}
