//! Error types for vbstore
//!
//! Errors describe internal failures (I/O, corrupt log blocks, underlying
//! store faults, bad configuration). Client-visible outcomes of engine
//! operations are expressed with [`crate::Status`] instead.

use thiserror::Error;

/// Common result type for vbstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for vbstore
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("invalid mutation log header: {0}")]
    InvalidLogHeader(String),

    #[error("checksum mismatch in block {block}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { block: u64, expected: u32, actual: u32 },

    #[error("underlying store error: {0}")]
    UnderlyingStore(String),

    #[error("serialization error: {0}")]
    Serialization(String),

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
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an underlying store error
    pub fn underlying(msg: impl Into<String>) -> Self {
        Self::UnderlyingStore(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::UnderlyingStore(_))
    }

    /// Check if the error means on-disk data can no longer be trusted
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption(_) | Self::InvalidLogHeader(_) | Self::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::underlying("commit failed").is_retryable());
        assert!(Error::Io(std::io::Error::other("disk")).is_retryable());
        assert!(!Error::configuration("bad").is_retryable());
        assert!(!Error::Serialization("bad record".into()).is_retryable());
    }

    #[test]
    fn test_error_corruption() {
        assert!(Error::corruption("torn block").is_corruption());
        assert!(
            Error::ChecksumMismatch {
                block: 3,
                expected: 1,
                actual: 2
            }
            .is_corruption()
        );
        assert!(!Error::internal("x").is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidLogHeader("bad magic".into());
        assert_eq!(err.to_string(), "invalid mutation log header: bad magic");
    }
}
