//! blobmap Cluster Map - topology and health of a blob storage cluster
//!
//! Three views implement the [`ClusterMap`] read API:
//!
//! - [`StaticClusterManager`]: built once from a layout file
//! - [`DynamicClusterManager`]: kept current by a coordination service,
//!   one session per datacenter
//! - [`CompositeClusterManager`]: queries both and counts divergent answers
//!
//! Request outcomes reported through [`ClusterMap::on_replica_event`] and
//! [`ClusterMap::on_server_error`] drive per-node, per-disk and per-replica
//! failure thresholds.
//!
//! # Example
//! ```ignore
//! use blobmap_clustermap::{ClusterMap, DynamicClusterManager, InMemoryCoordinator};
//!
//! let map = DynamicClusterManager::new(config, &coordinator)?;
//! for partition in map.get_writable_partition_ids(None) {
//!     println!("{partition}");
//! }
//! ```

pub mod cluster_map;
pub mod composite;
pub mod coordination;
pub mod dynamic;
pub mod ingest;
pub mod liveness;
pub mod metrics;
pub mod partition;
pub mod static_map;
pub mod topology;

#[cfg(test)]
mod test_utils;

pub use cluster_map::ClusterMap;
pub use composite::CompositeClusterManager;
pub use coordination::{
    ClusterChangeListener, CoordinationService, CoordinationSession, DiskRecord, InMemoryCoordinator,
    InstanceRecord, ReplicaRecord,
};
pub use dynamic::DynamicClusterManager;
pub use ingest::{ChangeIngestor, DatacenterListener, IngestSummary};
pub use liveness::FailureTracker;
pub use metrics::{
    CheckedOperation, ClusterMapMetrics, ClusterMapStats, MismatchCounters, PrometheusExporter,
};
pub use partition::{PARTITION_ID_SIZE, Partition, encode_partition_id};
pub use static_map::{StaticClusterManager, StaticLayout};
pub use topology::{ClusterTopology, DataNode, Datacenter, Disk, Replica};
