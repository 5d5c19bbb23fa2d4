//! Configuration types for blobmap
//!
//! This module defines the configuration consumed by the cluster map
//! implementations and the binaries that host them.

use crate::error::{Error, Result};
use crate::types::DEFAULT_PARTITION_CLASS;
use serde::{Deserialize, Serialize};

/// Root configuration for blobmap
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster map configuration
    pub cluster_map: ClusterMapConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cluster map configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterMapConfig {
    /// Name of the cluster in the coordination service
    pub cluster_name: String,
    /// Hostname of the process hosting this cluster map
    pub host_name: String,
    /// Name of the datacenter this process runs in
    pub datacenter_name: String,
    /// Datacenters to track, each with its own coordination endpoint
    pub datacenters: Vec<DatacenterConfig>,
    /// Transaction id floor; records with a higher xid are not applied
    pub current_xid: i64,
    /// Consecutive node timeouts before a node is marked unavailable
    pub fixed_timeout_datanode_error_threshold: u32,
    /// Consecutive disk errors before a disk is marked unavailable
    pub fixed_timeout_disk_error_threshold: u32,
    /// Consecutive replica errors before a replica is marked down
    pub fixed_timeout_replica_error_threshold: u32,
    /// Partition class used when a partition does not declare one
    pub default_partition_class: String,
}

impl Default for ClusterMapConfig {
    fn default() -> Self {
        Self {
            cluster_name: "blobmap".to_string(),
            host_name: "localhost".to_string(),
            datacenter_name: "DC0".to_string(),
            datacenters: vec![DatacenterConfig::default()],
            current_xid: i64::MAX,
            fixed_timeout_datanode_error_threshold: 3,
            fixed_timeout_disk_error_threshold: 1,
            fixed_timeout_replica_error_threshold: 1,
            default_partition_class: DEFAULT_PARTITION_CLASS.to_string(),
        }
    }
}

impl ClusterMapConfig {
    /// Failure thresholds for the liveness state machine
    #[must_use]
    pub const fn thresholds(&self) -> FailureThresholds {
        FailureThresholds {
            datanode: self.fixed_timeout_datanode_error_threshold,
            disk: self.fixed_timeout_disk_error_threshold,
            replica: self.fixed_timeout_replica_error_threshold,
        }
    }

    /// Look up a configured datacenter by name
    #[must_use]
    pub fn datacenter(&self, name: &str) -> Option<&DatacenterConfig> {
        self.datacenters.iter().find(|dc| dc.name == name)
    }

    /// Id of the local datacenter, if it is configured
    #[must_use]
    pub fn local_datacenter_id(&self) -> Option<u8> {
        self.datacenter(&self.datacenter_name).map(|dc| dc.id)
    }

    /// Check the configuration for values the cluster map cannot work with
    pub fn validate(&self) -> Result<()> {
        let thresholds = self.thresholds();
        if thresholds.datanode == 0 || thresholds.disk == 0 || thresholds.replica == 0 {
            return Err(Error::configuration("failure thresholds must be at least 1"));
        }
        if self.datacenters.is_empty() {
            return Err(Error::configuration("no datacenters configured"));
        }
        if self.datacenter(&self.datacenter_name).is_none() {
            return Err(Error::configuration(format!(
                "local datacenter {} is not in the datacenter list",
                self.datacenter_name
            )));
        }
        for (i, dc) in self.datacenters.iter().enumerate() {
            if self.datacenters[..i]
                .iter()
                .any(|other| other.name == dc.name || other.id == dc.id)
            {
                return Err(Error::configuration(format!(
                    "duplicate datacenter {} (id {})",
                    dc.name, dc.id
                )));
            }
        }
        Ok(())
    }
}

/// A datacenter tracked by the cluster map
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatacenterConfig {
    /// Datacenter name
    pub name: String,
    /// Numeric datacenter id
    pub id: u8,
    /// Address of the coordination service serving this datacenter
    pub coordination_endpoint: String,
}

impl Default for DatacenterConfig {
    fn default() -> Self {
        Self {
            name: "DC0".to_string(),
            id: 0,
            coordination_endpoint: "localhost:2199".to_string(),
        }
    }
}

/// Per-resource failure thresholds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureThresholds {
    /// Node timeouts before a node goes down
    pub datanode: u32,
    /// Disk errors before a disk goes down
    pub disk: u32,
    /// Replica errors before a replica goes down
    pub replica: u32,
}

impl Default for FailureThresholds {
    fn default() -> Self {
        ClusterMapConfig::default().thresholds()
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
