//! Error types for stripeio
//!
//! This module defines the common error type used throughout the engine.

use thiserror::Error;

/// Common result type for stripeio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for stripeio
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("version mismatch on optimistic write: {0}")]
    VersionMismatch(String),

    #[error("unreadable: {0}")]
    Unreadable(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("no valid connection: {0}")]
    Connection(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new i/o error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Errno equivalent for the file-io facade.
    ///
    /// Transient drive outages stay invisible while quorum holds; what
    /// surfaces here is what a client of the block layer would see.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 22, // EINVAL
            Self::NotFound(_) => 2,         // ENOENT
            Self::Connection(_) => 6,       // ENXIO
            Self::Internal(_) => 19,        // ENODEV
            Self::VersionMismatch(_) | Self::Unreadable(_) | Self::Io(_) => 5, // EIO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::io("timeout").is_retryable());
        assert!(Error::Connection("down".into()).is_retryable());
        assert!(!Error::invalid_argument("bad offset").is_retryable());
    }

    #[test]
    fn test_error_errno() {
        assert_eq!(Error::invalid_argument("x").errno(), 22);
        assert_eq!(Error::io("x").errno(), 5);
        assert_eq!(Error::Unreadable("x".into()).errno(), 5);
        assert_eq!(Error::internal("x").errno(), 19);
    }
}
