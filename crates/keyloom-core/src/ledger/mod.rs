//! Key material ledger and provision ratcheting.
//!
//! Everything here is owned by a channel: only [`crate::channel::Channel`]
//! and the maintenance pass call into it.

pub mod key_material;
pub mod provision;

pub use key_material::KeyMaterial;
pub use provision::{Provision, delete_empty_provisions};
