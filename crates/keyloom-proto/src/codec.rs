//! CBOR codec for protocol values.
//!
//! Every protocol message body, protocol state and storage record goes
//! through these two functions.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{ProtocolError, Result};

/// Maximum size of any encoded value (1 MiB).
pub const MAX_ENCODED_SIZE: usize = 1 << 20;

/// Encode a value as CBOR.
///
/// # Errors
///
/// - `CborEncode` if serialization fails
/// - `TooLarge` if the encoding exceeds [`MAX_ENCODED_SIZE`]
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;

    if bytes.len() > MAX_ENCODED_SIZE {
        return Err(ProtocolError::TooLarge { size: bytes.len(), max: MAX_ENCODED_SIZE });
    }

    Ok(bytes)
}

/// Decode a CBOR value.
///
/// The size check runs before the parser so oversized input is never
/// parsed.
///
/// # Errors
///
/// - `TooLarge` if `bytes` exceeds [`MAX_ENCODED_SIZE`]
/// - `CborDecode` if the bytes do not decode as `T`
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() > MAX_ENCODED_SIZE {
        return Err(ProtocolError::TooLarge { size: bytes.len(), max: MAX_ENCODED_SIZE });
    }

    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
