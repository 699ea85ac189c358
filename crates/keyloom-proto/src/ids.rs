//! Fixed-size identifiers.
//!
//! All identifiers are 32 opaque bytes. They order and hash by byte value so
//! they can be used directly as storage key components.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! uid_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Wrap raw identifier bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Raw identifier bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                for byte in &self.0[..4] {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "..)")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0[..8] {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    };
}

uid_type!(
    /// Cryptographic identity of a user: the X25519 public key the asymmetric
    /// bootstrap channel seals messages to.
    IdentityId
);

uid_type!(
    /// One device of an identity.
    DeviceUid
);

uid_type!(
    /// Unique id of a running protocol instance.
    InstanceUid
);

uid_type!(
    /// Unique id of a received protocol message (inbox key).
    MessageUid
);
