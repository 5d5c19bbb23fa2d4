//! The cluster map read API
//!
//! [`ClusterMap`] is implemented by the static map (built once from a layout),
//! the dynamic map (kept current by the coordination service) and the
//! composite view that cross-checks the two. The helpers at the bottom hold
//! the logic the two topology-backed maps share.

use crate::liveness;
use crate::metrics::ClusterMapStats;
use crate::partition::{Partition, read_partition_number};
use crate::topology::{ClusterTopology, DataNode, Replica};
use blobmap_common::{Error, ReplicaEventType, Result, ServerErrorCode};
use std::io::Read;
use std::sync::Arc;
use tracing::warn;

/// Queryable view of cluster topology and health
///
/// Entity handles returned by one cluster map are only valid as arguments to
/// the same cluster map.
pub trait ClusterMap: Send + Sync {
    /// Id of the datacenter this process runs in
    fn local_datacenter_id(&self) -> Option<u8>;

    fn has_datacenter(&self, name: &str) -> bool;

    /// Look up a data node by hostname and port
    fn get_data_node_id(&self, hostname: &str, port: u16) -> Option<Arc<DataNode>>;

    /// All data nodes, ordered by instance name
    fn get_data_node_ids(&self) -> Vec<Arc<DataNode>>;

    /// Replicas hosted on a node
    ///
    /// Fails with [`Error::InvalidArgument`] if the node belongs to another
    /// cluster map.
    fn get_replica_ids(&self, node: &DataNode) -> Result<Vec<Arc<Replica>>>;

    /// All partitions, optionally restricted to a partition class
    fn get_all_partition_ids(&self, partition_class: Option<&str>) -> Vec<Arc<Partition>>;

    /// Read-write partitions, optionally restricted to a partition class
    fn get_writable_partition_ids(&self, partition_class: Option<&str>) -> Vec<Arc<Partition>>;

    /// Decode a serialized partition identifier and resolve it
    fn get_partition_id_from_stream(&self, stream: &mut dyn Read) -> Result<Arc<Partition>>;

    /// Feed a request outcome into the failure thresholds
    fn on_replica_event(&self, replica: &Replica, event: ReplicaEventType);

    /// Apply a server-reported error code
    fn on_server_error(&self, replica: &Replica, code: ServerErrorCode);

    fn metrics_snapshot(&self) -> ClusterMapStats;

    /// Metrics in Prometheus text format
    fn export_metrics(&self) -> String;

    /// Release coordination sessions. Idempotent.
    fn close(&self);
}

pub(crate) fn replicas_of(topology: &ClusterTopology, node: &DataNode) -> Result<Vec<Arc<Replica>>> {
    if node.map_id() != topology.map_id() {
        return Err(Error::invalid_argument(format!(
            "data node {} does not belong to this cluster map",
            node.instance_name()
        )));
    }
    Ok(topology
        .replicas_on(node.instance_name())
        .unwrap_or_default())
}

pub(crate) fn partition_from_stream(
    topology: &ClusterTopology,
    stream: &mut dyn Read,
) -> Result<Arc<Partition>> {
    let id = read_partition_number(stream)?;
    topology
        .get_partition(id)
        .ok_or_else(|| Error::deserialization(format!("partition {id} is not in the cluster map")))
}

fn owns_replica(topology: &ClusterTopology, replica: &Replica) -> bool {
    if replica.map_id() == topology.map_id() {
        return true;
    }
    warn!("Ignoring report for replica {} owned by another cluster map", replica);
    false
}

pub(crate) fn report_replica_event(topology: &ClusterTopology, replica: &Replica, event: ReplicaEventType) {
    if owns_replica(topology, replica) {
        liveness::apply_replica_event(replica, event);
    }
}

pub(crate) fn report_server_error(topology: &ClusterTopology, replica: &Replica, code: ServerErrorCode) {
    if owns_replica(topology, replica) {
        liveness::apply_server_error(replica, code);
    }
}
