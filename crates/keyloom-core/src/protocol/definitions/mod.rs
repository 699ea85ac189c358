//! Protocols shipped with the engine.

pub mod channel_creation;
pub mod device_discovery;
pub mod full_ratchet;

pub use channel_creation::{ChannelCreation, ChannelCreationMessage, ChannelCreationState};
pub use device_discovery::{DeviceDiscovery, DeviceDiscoveryMessage, DeviceDiscoveryState};
pub use full_ratchet::{FullRatchet, FullRatchetMessage, FullRatchetState};
use keyloom_proto::{DeviceUid, IdentityId};

use super::{StepContext, StepError};

/// Remote endpoint the triggering message came from.
///
/// Only called from steps whose reception kind carries a sender.
fn sender(ctx: &StepContext<'_, '_>) -> Result<(IdentityId, DeviceUid), StepError> {
    ctx.reception().remote().ok_or(StepError::NotApplicable)
}

/// Fail with a violation unless the message came from `expected`.
fn require_sender(
    ctx: &StepContext<'_, '_>,
    identity: IdentityId,
    device: DeviceUid,
) -> Result<(), StepError> {
    let (remote_identity, remote_device) = sender(ctx)?;
    if remote_identity != identity || remote_device != device {
        return Err(StepError::violation(format!(
            "expected message from {identity}/{device}, got {remote_identity}/{remote_device}"
        )));
    }
    Ok(())
}

/// Constant-time comparison of two tags.
fn tags_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
