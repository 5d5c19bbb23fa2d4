//! Error types for blobmap
//!
//! This module defines the common error types used by the cluster map and its
//! callers.

use thiserror::Error;

/// Common result type for blobmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blobmap
#[derive(Debug, Error)]
pub enum Error {
    // Construction errors
    #[error("cluster map initialization failed for datacenter {datacenter}: {source}")]
    Initialization {
        datacenter: String,
        #[source]
        source: Box<Error>,
    },

    #[error("coordination service error: {0}")]
    Coordination(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Query errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Ingestion errors
    #[error("invalid record for {instance}: {reason}")]
    InvalidRecord { instance: String, reason: String },

    #[error("node not found: {0}")]
    NodeNotFound(String),
}

impl Error {
    /// Wrap a failure that happened while bringing up a datacenter
    pub fn initialization(datacenter: impl Into<String>, source: Self) -> Self {
        Self::Initialization {
            datacenter: datacenter.into(),
            source: Box::new(source),
        }
    }

    /// Create a coordination service error
    pub fn coordination(msg: impl Into<String>) -> Self {
        Self::Coordination(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a deserialization error
    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }

    /// Create an invalid record error
    pub fn invalid_record(instance: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error happened while constructing a cluster map
    #[must_use]
    pub fn is_initialization(&self) -> bool {
        matches!(self, Self::Initialization { .. })
    }

    /// Check if this error reports a malformed or unknown serialized identifier
    #[must_use]
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Deserialization(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_initialization_source() {
        let err = Error::initialization("DC0", Error::coordination("beBad"));
        assert!(err.is_initialization());
        assert_eq!(err.source().unwrap().to_string(), "coordination service error: beBad");
        assert!(err.to_string().contains("DC0"));
    }

    #[test]
    fn test_error_classes() {
        assert!(Error::deserialization("bad version").is_decode_failure());
        assert!(
            Error::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).is_decode_failure()
        );
        assert!(!Error::invalid_argument("foreign node").is_decode_failure());
        assert_eq!(Error::NodeNotFound("h_1".into()).to_string(), "node not found: h_1");
    }
}
