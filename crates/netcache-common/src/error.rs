//! Error types for netcache
//!
//! Nothing in the storage engine is fatal: runtime failures are logged and
//! degrade to a cache miss. These errors surface from `open`, key
//! construction, configuration, and the internal decode paths that decide
//! whether a file on disk is usable.

use thiserror::Error;

/// Common result type for netcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for netcache
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record not found")]
    NotFound,

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("unsupported format version: {0}")]
    VersionMismatch(u32),

    #[error("truncated data: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("corrupt entry: {0}")]
    Corrupt(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("read timed out")]
    Timeout,

    #[error("storage is shut down")]
    Closed,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create an invalid key error
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Check if this is a plain miss
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this error means the bytes on disk cannot be trusted.
    /// The offending entry should be deleted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::DigestMismatch { .. }
                | Self::VersionMismatch(_)
                | Self::Truncated { .. }
                | Self::Corrupt(_)
        )
    }

    /// Check if retrying (typically from the network instead) makes sense
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::NotFound.is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::Io(io).is_not_found());
        assert!(!Error::Timeout.is_not_found());
    }

    #[test]
    fn test_error_corruption() {
        assert!(
            Error::ChecksumMismatch {
                expected: 1,
                actual: 2
            }
            .is_corruption()
        );
        assert!(Error::VersionMismatch(3).is_corruption());
        assert!(
            Error::Truncated {
                needed: 8,
                available: 2
            }
            .is_corruption()
        );
        assert!(!Error::NotFound.is_corruption());
        assert!(!Error::Timeout.is_corruption());
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(!Error::corrupt("bad").is_retryable());
    }

    #[test]
    fn test_checksum_message() {
        let err = Error::ChecksumMismatch {
            expected: 0xdead_beef,
            actual: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected deadbeef, got 00000001"
        );
    }
}
