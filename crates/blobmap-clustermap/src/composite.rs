//! Consistency-checking view over a static and a dynamic cluster map
//!
//! Every read runs against both maps and the dynamic result is returned.
//! Divergent results are counted per operation and never surface as errors.
//! Results are compared by partition id, instance name, and
//! (partition id, mount path) for replicas.

use crate::cluster_map::ClusterMap;
use crate::metrics::{CheckedOperation, ClusterMapStats, MismatchCounters, PrometheusExporter};
use crate::partition::{PARTITION_ID_SIZE, Partition};
use crate::topology::{DataNode, Replica};
use blobmap_common::{Error, InstanceName, ReplicaEventType, Result, ServerErrorCode};
use std::fmt::Debug;
use std::io::Read;
use std::sync::Arc;
use tracing::warn;

/// Cluster map that cross-checks a dynamic map against a static one
pub struct CompositeClusterManager {
    static_map: Arc<dyn ClusterMap>,
    dynamic: Arc<dyn ClusterMap>,
    mismatches: MismatchCounters,
    exporter: PrometheusExporter,
}

impl CompositeClusterManager {
    #[must_use]
    pub fn new(static_map: Arc<dyn ClusterMap>, dynamic: Arc<dyn ClusterMap>) -> Self {
        Self {
            static_map,
            dynamic,
            mismatches: MismatchCounters::new(),
            exporter: PrometheusExporter::default(),
        }
    }

    #[must_use]
    pub const fn mismatches(&self) -> &MismatchCounters {
        &self.mismatches
    }

    #[must_use]
    pub fn static_map(&self) -> &Arc<dyn ClusterMap> {
        &self.static_map
    }

    #[must_use]
    pub fn dynamic(&self) -> &Arc<dyn ClusterMap> {
        &self.dynamic
    }

    fn check<T: PartialEq + Debug>(&self, operation: CheckedOperation, static_result: &T, dynamic_result: &T) {
        if static_result != dynamic_result {
            self.mismatches.record(operation);
            warn!(
                "{} mismatch: static {:?}, dynamic {:?}",
                operation.as_str(),
                static_result,
                dynamic_result
            );
        }
    }
}

fn partition_keys(partitions: &[Arc<Partition>]) -> Vec<u64> {
    let mut ids: Vec<u64> = partitions.iter().map(|p| p.id()).collect();
    ids.sort_unstable();
    ids
}

fn node_keys(nodes: &[Arc<DataNode>]) -> Vec<InstanceName> {
    let mut names: Vec<InstanceName> = nodes.iter().map(|n| n.instance_name().clone()).collect();
    names.sort();
    names
}

fn replica_keys(replicas: &[Arc<Replica>]) -> Vec<(u64, String)> {
    let mut keys: Vec<(u64, String)> = replicas
        .iter()
        .map(|r| (r.partition_id(), r.disk().mount_path().to_string()))
        .collect();
    keys.sort();
    keys
}

impl ClusterMap for CompositeClusterManager {
    fn local_datacenter_id(&self) -> Option<u8> {
        self.dynamic.local_datacenter_id()
    }

    fn has_datacenter(&self, name: &str) -> bool {
        let dynamic_result = self.dynamic.has_datacenter(name);
        let static_result = self.static_map.has_datacenter(name);
        self.check(CheckedOperation::HasDatacenter, &static_result, &dynamic_result);
        dynamic_result
    }

    fn get_data_node_id(&self, hostname: &str, port: u16) -> Option<Arc<DataNode>> {
        let dynamic_result = self.dynamic.get_data_node_id(hostname, port);
        let static_result = self.static_map.get_data_node_id(hostname, port);
        self.check(
            CheckedOperation::GetDataNodeId,
            &static_result.as_ref().map(|n| n.instance_name().clone()),
            &dynamic_result.as_ref().map(|n| n.instance_name().clone()),
        );
        dynamic_result
    }

    fn get_data_node_ids(&self) -> Vec<Arc<DataNode>> {
        let dynamic_result = self.dynamic.get_data_node_ids();
        let static_result = self.static_map.get_data_node_ids();
        self.check(
            CheckedOperation::GetDataNodeIds,
            &node_keys(&static_result),
            &node_keys(&dynamic_result),
        );
        dynamic_result
    }

    /// Accepts a node handle from either underlying map
    fn get_replica_ids(&self, node: &DataNode) -> Result<Vec<Arc<Replica>>> {
        let dynamic_result = match self.dynamic.get_replica_ids(node) {
            Err(Error::InvalidArgument(reason)) => {
                let equivalent = self
                    .dynamic
                    .get_data_node_id(node.hostname(), node.port())
                    .ok_or(Error::InvalidArgument(reason))?;
                self.dynamic.get_replica_ids(&equivalent)?
            }
            other => other?,
        };

        let static_result = match self.static_map.get_data_node_id(node.hostname(), node.port()) {
            Some(static_node) => self.static_map.get_replica_ids(&static_node).ok(),
            None => None,
        };
        self.check(
            CheckedOperation::GetReplicaIds,
            &static_result.as_deref().map(replica_keys),
            &Some(replica_keys(&dynamic_result)),
        );
        Ok(dynamic_result)
    }

    fn get_all_partition_ids(&self, partition_class: Option<&str>) -> Vec<Arc<Partition>> {
        let dynamic_result = self.dynamic.get_all_partition_ids(partition_class);
        let static_result = self.static_map.get_all_partition_ids(partition_class);
        self.check(
            CheckedOperation::GetAllPartitionIds,
            &partition_keys(&static_result),
            &partition_keys(&dynamic_result),
        );
        dynamic_result
    }

    fn get_writable_partition_ids(&self, partition_class: Option<&str>) -> Vec<Arc<Partition>> {
        let dynamic_result = self.dynamic.get_writable_partition_ids(partition_class);
        let static_result = self.static_map.get_writable_partition_ids(partition_class);
        self.check(
            CheckedOperation::GetWritablePartitionIds,
            &partition_keys(&static_result),
            &partition_keys(&dynamic_result),
        );
        dynamic_result
    }

    /// Reads one encoded identifier and decodes it against both maps
    fn get_partition_id_from_stream(&self, stream: &mut dyn Read) -> Result<Arc<Partition>> {
        let mut encoded = Vec::with_capacity(PARTITION_ID_SIZE);
        stream
            .take(PARTITION_ID_SIZE as u64)
            .read_to_end(&mut encoded)?;

        let dynamic_result = self.dynamic.get_partition_id_from_stream(&mut encoded.as_slice());
        let static_result = self.static_map.get_partition_id_from_stream(&mut encoded.as_slice());
        self.check(
            CheckedOperation::GetPartitionIdFromStream,
            &static_result.as_ref().ok().map(|p| p.id()),
            &dynamic_result.as_ref().ok().map(|p| p.id()),
        );
        dynamic_result
    }

    fn on_replica_event(&self, replica: &Replica, event: ReplicaEventType) {
        self.dynamic.on_replica_event(replica, event);
    }

    fn on_server_error(&self, replica: &Replica, code: ServerErrorCode) {
        self.dynamic.on_server_error(replica, code);
    }

    fn metrics_snapshot(&self) -> ClusterMapStats {
        self.dynamic.metrics_snapshot()
    }

    fn export_metrics(&self) -> String {
        let mut output = self.dynamic.export_metrics();
        output.push_str(&self.exporter.export_mismatches(&self.mismatches));
        output
    }

    fn close(&self) {
        self.dynamic.close();
        self.static_map.close();
    }
}
