//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A stored record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if this error may succeed on retry.
    ///
    /// I/O failures are transient. A record that fails to decode will fail
    /// the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<keyloom_proto::ProtocolError> for StorageError {
    fn from(err: keyloom_proto::ProtocolError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_io_is_transient() {
        assert!(StorageError::Io("disk full".to_string()).is_transient());
        assert!(!StorageError::Serialization("bad cbor".to_string()).is_transient());
    }
}
