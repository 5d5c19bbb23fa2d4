//! Core type definitions for blobmap
//!
//! This module defines the vocabulary shared by every cluster map
//! implementation: instance identity, hardware and partition states, and the
//! failure events reported by the request path.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition class assigned to partitions that do not name one explicitly
pub const DEFAULT_PARTITION_CLASS: &str = "default";

/// Canonical name of a storage node instance (`{hostname}_{port}`)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct InstanceName(String);

impl InstanceName {
    /// Build the instance name for a host and port
    #[must_use]
    pub fn new(hostname: &str, port: u16) -> Self {
        Self(format!("{hostname}_{port}"))
    }

    /// Wrap an already formatted instance name
    #[must_use]
    pub fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the instance name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceName({:?})", self.0)
    }
}

impl From<&str> for InstanceName {
    fn from(name: &str) -> Self {
        Self::from_raw(name)
    }
}

/// Binary availability of a node or disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum HardwareState {
    #[default]
    #[display("available")]
    Available,
    #[display("unavailable")]
    Unavailable,
}

impl HardwareState {
    /// Map a "down" flag onto a hardware state
    #[must_use]
    pub const fn from_down(down: bool) -> Self {
        if down {
            Self::Unavailable
        } else {
            Self::Available
        }
    }

    /// Check if the resource is available
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Writability of a partition, derived from its replicas' sealed flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionState {
    #[default]
    #[display("read-write")]
    ReadWrite,
    #[display("read-only")]
    ReadOnly,
}

impl PartitionState {
    /// Encode for storage in an atomic cell
    #[must_use]
    pub const fn as_raw(self) -> u8 {
        match self {
            Self::ReadWrite => 0,
            Self::ReadOnly => 1,
        }
    }

    /// Decode a value previously produced by [`PartitionState::as_raw`]
    #[must_use]
    pub const fn from_raw(value: u8) -> Self {
        if value == 0 {
            Self::ReadWrite
        } else {
            Self::ReadOnly
        }
    }
}

/// Failure and recovery signals observed on the request path
///
/// Each event is scoped to a replica but may act on the replica's node, disk,
/// or the replica itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ReplicaEventType {
    #[display("node_timeout")]
    NodeTimeout,
    #[display("node_response_ok")]
    NodeResponseOk,
    #[display("disk_error")]
    DiskError,
    #[display("disk_ok")]
    DiskOk,
    #[display("replica_unavailable")]
    ReplicaUnavailable,
    #[display("replica_available")]
    ReplicaAvailable,
    /// Reserved; partition writability is driven by sealed flags only
    #[display("partition_read_only")]
    PartitionReadOnly,
}

/// Error codes returned by storage servers, as classified by the network layer
///
/// A subset of these carry enough confidence to force a resource state
/// immediately, without going through the failure thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ServerErrorCode {
    #[display("no_error")]
    NoError,
    #[display("blob_not_found")]
    BlobNotFound,
    #[display("blob_deleted")]
    BlobDeleted,
    #[display("blob_expired")]
    BlobExpired,
    #[display("replica_unavailable")]
    ReplicaUnavailable,
    #[display("disk_unavailable")]
    DiskUnavailable,
    #[display("io_error")]
    IoError,
    #[display("temporarily_disabled")]
    TemporarilyDisabled,
    #[display("partition_read_only")]
    PartitionReadOnly,
    #[display("unknown_error")]
    UnknownError,
}
