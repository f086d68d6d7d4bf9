//! Error types for Cascade
//!
//! This module defines the common error type used throughout the system.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for Cascade operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Cascade
///
/// The same error may be delivered to several parked requesters, so every
/// variant is cheaply cloneable. Errors also travel verbatim inside wire
/// responses, hence the serde derives.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    // Cache errors
    #[error("blob not found")]
    NotFound,

    #[error("payload exceeds blob size limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("digest integrity mismatch")]
    Integrity,

    // Request errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("operation is only valid on the root node")]
    InvalidRole,

    // Backing store errors
    #[error("no backing store service is registered")]
    NoBackingService,

    #[error("not implemented")]
    NotImplemented,

    #[error("backing store is already active")]
    Busy,

    #[error("backing store name cannot be changed (bound to {bound})")]
    NameMismatch { bound: String },

    // Mmap errors
    #[error("path is already mapped: {0}")]
    AlreadyExists(String),

    // I/O and lifecycle errors
    #[error("i/o error: {0}")]
    Io(String),

    #[error("service is shutting down")]
    Shutdown,
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Check if this error indicates a missing blob
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Check if this error is unrecoverable for the flush engine
    ///
    /// Flush stops draining its queue on these; everything else is latched
    /// and surfaced but draining continues.
    #[must_use]
    pub fn is_flush_fatal(&self) -> bool {
        matches!(self, Self::NoBackingService | Self::NotImplemented)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::NotFound.is_not_found());
        assert!(!Error::Busy.is_not_found());
    }

    #[test]
    fn test_error_flush_fatal() {
        assert!(Error::NoBackingService.is_flush_fatal());
        assert!(Error::NotImplemented.is_flush_fatal());
        assert!(!Error::Io("disk full".into()).is_flush_fatal());
    }

    #[test]
    fn test_error_from_io() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_display() {
        let err = Error::PayloadTooLarge { limit: 1024 };
        assert_eq!(
            err.to_string(),
            "payload exceeds blob size limit of 1024 bytes"
        );
    }
}
