//! Cluster map built once from a static layout
//!
//! The layout lists datacenters, their nodes and disks, and every partition
//! with its replica placement. A read-only partition has all of its replicas
//! sealed. Nothing changes after construction except liveness, which follows
//! the replica events reported to this map.

use crate::cluster_map::{self, ClusterMap};
use crate::coordination::{DiskRecord, InstanceRecord, ReplicaRecord};
use crate::metrics::{ClusterMapStats, PrometheusExporter, topology_stats};
use crate::partition::Partition;
use crate::topology::{ClusterTopology, DataNode, NodeSpec, Replica};
use blobmap_common::{
    ClusterMapConfig, Error, InstanceName, PartitionState, ReplicaEventType, Result,
    ServerErrorCode,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use tracing::info;

/// Full static description of a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticLayout {
    pub cluster_name: String,
    #[serde(default)]
    pub version: u64,
    pub datacenters: Vec<DatacenterLayout>,
    #[serde(default)]
    pub partitions: Vec<PartitionLayout>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatacenterLayout {
    pub name: String,
    pub id: u8,
    #[serde(default)]
    pub nodes: Vec<NodeLayout>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLayout {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub rack_id: Option<String>,
    pub disks: Vec<DiskLayout>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLayout {
    pub mount_path: String,
    pub capacity_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLayout {
    pub id: u64,
    /// Empty means the configured default class
    #[serde(default)]
    pub partition_class: String,
    #[serde(default)]
    pub state: PartitionState,
    pub replicas: Vec<ReplicaLayout>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLayout {
    pub hostname: String,
    pub port: u16,
    pub mount_path: String,
}

impl StaticLayout {
    /// Check that the layout describes a consistent cluster
    pub fn validate(&self) -> Result<()> {
        let mut dc_names = HashSet::new();
        let mut dc_ids = HashSet::new();
        let mut disks: HashMap<InstanceName, HashSet<&str>> = HashMap::new();
        for dc in &self.datacenters {
            if !dc_names.insert(dc.name.as_str()) || !dc_ids.insert(dc.id) {
                return Err(Error::configuration(format!(
                    "duplicate datacenter {} (id {})",
                    dc.name, dc.id
                )));
            }
            for node in &dc.nodes {
                let instance = InstanceName::new(&node.hostname, node.port);
                let mut mounts = HashSet::new();
                for disk in &node.disks {
                    if !mounts.insert(disk.mount_path.as_str()) {
                        return Err(Error::configuration(format!(
                            "disk {} declared twice on {}",
                            disk.mount_path, instance
                        )));
                    }
                }
                if disks.insert(instance.clone(), mounts).is_some() {
                    return Err(Error::configuration(format!("duplicate data node {instance}")));
                }
            }
        }

        let mut partition_ids = HashSet::new();
        for partition in &self.partitions {
            if !partition_ids.insert(partition.id) {
                return Err(Error::configuration(format!(
                    "duplicate partition {}",
                    partition.id
                )));
            }
            let mut hosts = HashSet::new();
            for replica in &partition.replicas {
                let instance = InstanceName::new(&replica.hostname, replica.port);
                let Some(mounts) = disks.get(&instance) else {
                    return Err(Error::configuration(format!(
                        "partition {} has a replica on unknown node {}",
                        partition.id, instance
                    )));
                };
                if !mounts.contains(replica.mount_path.as_str()) {
                    return Err(Error::configuration(format!(
                        "partition {} has a replica on unknown disk {}:{}",
                        partition.id, instance, replica.mount_path
                    )));
                }
                if !hosts.insert(instance) {
                    return Err(Error::configuration(format!(
                        "partition {} has two replicas on {}:{}",
                        partition.id, replica.hostname, replica.port
                    )));
                }
            }
        }
        Ok(())
    }

    /// Per-datacenter instance records describing the same cluster, in the
    /// form the coordination service publishes them
    #[must_use]
    pub fn to_instance_records(&self, xid: Option<i64>) -> BTreeMap<String, Vec<InstanceRecord>> {
        let mut records: BTreeMap<InstanceName, InstanceRecord> = BTreeMap::new();
        for dc in &self.datacenters {
            for node in &dc.nodes {
                let mut record = InstanceRecord::new(&node.hostname, node.port, &dc.name);
                record.rack_id.clone_from(&node.rack_id);
                record.xid = xid;
                record.disks = node
                    .disks
                    .iter()
                    .map(|disk| DiskRecord {
                        mount_path: disk.mount_path.clone(),
                        capacity_bytes: disk.capacity_bytes,
                        replicas: Vec::new(),
                    })
                    .collect();
                records.insert(record.instance_name(), record);
            }
        }

        for partition in &self.partitions {
            for replica in &partition.replicas {
                let instance = InstanceName::new(&replica.hostname, replica.port);
                let Some(record) = records.get_mut(&instance) else {
                    continue;
                };
                if let Some(disk) = record
                    .disks
                    .iter_mut()
                    .find(|d| d.mount_path == replica.mount_path)
                {
                    disk.replicas.push(ReplicaRecord {
                        partition_id: partition.id,
                        partition_class: partition.partition_class.clone(),
                    });
                }
                if partition.state == PartitionState::ReadOnly {
                    record.set_sealed(partition.id, true);
                }
            }
        }

        let mut by_datacenter: BTreeMap<String, Vec<InstanceRecord>> = self
            .datacenters
            .iter()
            .map(|dc| (dc.name.clone(), Vec::new()))
            .collect();
        for record in records.into_values() {
            by_datacenter
                .entry(record.datacenter.clone())
                .or_default()
                .push(record);
        }
        by_datacenter
    }
}

/// Cluster map over a [`StaticLayout`]
#[derive(Debug)]
pub struct StaticClusterManager {
    topology: Arc<ClusterTopology>,
    local_datacenter_id: Option<u8>,
    exporter: PrometheusExporter,
}

impl StaticClusterManager {
    /// Build the cluster map from a layout
    pub fn new(config: &ClusterMapConfig, layout: &StaticLayout) -> Result<Self> {
        layout.validate()?;
        let topology = Arc::new(ClusterTopology::new(config.thresholds()));

        for dc in &layout.datacenters {
            topology.add_datacenter(&dc.name, dc.id);
            for node in &dc.nodes {
                let (node_ref, _) = topology.register_node(NodeSpec {
                    hostname: node.hostname.clone(),
                    port: node.port,
                    datacenter: dc.name.clone(),
                    rack_id: node.rack_id.clone(),
                    xid: None,
                })?;
                for disk in &node.disks {
                    topology.add_disk(node_ref.instance_name(), &disk.mount_path, disk.capacity_bytes)?;
                }
                node_ref.mark_replicas_placed();
            }
        }

        let mut partitions = Vec::with_capacity(layout.partitions.len());
        for partition in &layout.partitions {
            let class = if partition.partition_class.is_empty() {
                config.default_partition_class.as_str()
            } else {
                partition.partition_class.as_str()
            };
            let (created, _) = topology.get_or_create_partition(partition.id, class);
            let sealed = partition.state == PartitionState::ReadOnly;
            for replica in &partition.replicas {
                topology.add_replica(
                    &created,
                    &InstanceName::new(&replica.hostname, replica.port),
                    &replica.mount_path,
                    sealed,
                    false,
                )?;
            }
            partitions.push(created);
        }
        topology.publish_partitions(&partitions);

        info!(
            "Built static cluster map {} with {} datacenters, {} nodes and {} partitions",
            layout.cluster_name,
            layout.datacenters.len(),
            topology.node_count(),
            partitions.len()
        );
        Ok(Self {
            topology,
            local_datacenter_id: layout
                .datacenters
                .iter()
                .find(|dc| dc.name == config.datacenter_name)
                .map(|dc| dc.id),
            exporter: PrometheusExporter::default(),
        })
    }

    #[must_use]
    pub const fn topology(&self) -> &Arc<ClusterTopology> {
        &self.topology
    }
}

impl ClusterMap for StaticClusterManager {
    fn local_datacenter_id(&self) -> Option<u8> {
        self.local_datacenter_id
    }

    fn has_datacenter(&self, name: &str) -> bool {
        self.topology.has_datacenter(name)
    }

    fn get_data_node_id(&self, hostname: &str, port: u16) -> Option<Arc<DataNode>> {
        self.topology.find_node(hostname, port)
    }

    fn get_data_node_ids(&self) -> Vec<Arc<DataNode>> {
        self.topology.all_nodes()
    }

    fn get_replica_ids(&self, node: &DataNode) -> Result<Vec<Arc<Replica>>> {
        cluster_map::replicas_of(&self.topology, node)
    }

    fn get_all_partition_ids(&self, partition_class: Option<&str>) -> Vec<Arc<Partition>> {
        self.topology.select_partitions(partition_class, false)
    }

    fn get_writable_partition_ids(&self, partition_class: Option<&str>) -> Vec<Arc<Partition>> {
        self.topology.select_partitions(partition_class, true)
    }

    fn get_partition_id_from_stream(&self, stream: &mut dyn Read) -> Result<Arc<Partition>> {
        cluster_map::partition_from_stream(&self.topology, stream)
    }

    fn on_replica_event(&self, replica: &Replica, event: ReplicaEventType) {
        cluster_map::report_replica_event(&self.topology, replica, event);
    }

    fn on_server_error(&self, replica: &Replica, code: ServerErrorCode) {
        cluster_map::report_server_error(&self.topology, replica, code);
    }

    fn metrics_snapshot(&self) -> ClusterMapStats {
        topology_stats(&self.topology)
    }

    fn export_metrics(&self) -> String {
        self.exporter.export(&self.metrics_snapshot())
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::encode_partition_id;
    use crate::test_utils::{self, TestCluster};

    #[test]
    fn test_builds_from_layout() {
        let cluster = TestCluster::new(i64::MAX);
        let map = cluster.static_map();

        assert!(map.has_datacenter("DC0"));
        assert!(map.has_datacenter("DC1"));
        assert!(!map.has_datacenter("DC9"));
        assert_eq!(map.local_datacenter_id(), Some(0));
        assert_eq!(map.get_data_node_ids().len(), 6);
        assert_eq!(map.get_all_partition_ids(None).len(), test_utils::TOTAL_PARTITIONS);
        assert_eq!(
            map.get_all_partition_ids(Some(test_utils::SPECIAL_CLASS)).len(),
            test_utils::SPECIAL_RW + test_utils::SPECIAL_RO
        );
        assert_eq!(
            map.get_writable_partition_ids(Some(test_utils::SPECIAL_CLASS)).len(),
            test_utils::SPECIAL_RW
        );
        assert_eq!(
            map.get_writable_partition_ids(None).len(),
            test_utils::DEFAULT_RW + test_utils::SPECIAL_RW
        );
    }

    #[test]
    fn test_read_only_partitions_seal_every_replica() {
        let cluster = TestCluster::new(i64::MAX);
        let map = cluster.static_map();
        let read_only: Vec<_> = map
            .get_all_partition_ids(None)
            .into_iter()
            .filter(|p| !p.is_writable())
            .collect();
        assert_eq!(read_only.len(), test_utils::DEFAULT_RO + test_utils::SPECIAL_RO);
        for partition in read_only {
            assert!(partition.replicas().iter().all(|r| r.is_sealed()));
        }
    }

    #[test]
    fn test_partition_from_stream() {
        let cluster = TestCluster::new(i64::MAX);
        let map = cluster.static_map();
        for partition in map.get_all_partition_ids(None) {
            let bytes = partition.to_bytes();
            let decoded = map.get_partition_id_from_stream(&mut &bytes[..]).unwrap();
            assert_eq!(decoded.id(), partition.id());
        }

        let mut corrupted = encode_partition_id(1).to_vec();
        corrupted[2..].fill(0xff);
        let err = map.get_partition_id_from_stream(&mut &corrupted[..]).unwrap_err();
        assert!(err.is_decode_failure());
    }

    #[test]
    fn test_replica_events_on_static_map() {
        let cluster = TestCluster::new(i64::MAX);
        let map = cluster.static_map();
        let node = map.get_data_node_id("localhost", test_utils::BASE_PORT).unwrap();
        let replicas = map.get_replica_ids(&node).unwrap();
        assert!(!replicas.is_empty());

        map.on_replica_event(&replicas[0], ReplicaEventType::DiskError);
        assert!(replicas[0].disk().is_down());
        assert!(!node.is_down());
        assert_eq!(map.metrics_snapshot().disk_down_count, 1);
        map.on_replica_event(&replicas[0], ReplicaEventType::DiskOk);
        assert_eq!(map.metrics_snapshot().disk_down_count, 0);
    }

    #[test]
    fn test_foreign_node_rejected() {
        let cluster = TestCluster::new(i64::MAX);
        let a = cluster.static_map();
        let b = cluster.static_map();
        let node = b.get_data_node_id("localhost", test_utils::BASE_PORT).unwrap();
        let err = a.get_replica_ids(&node).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_invalid_layouts_rejected() {
        let config = ClusterMapConfig::default();
        let base = test_utils::layout();

        let mut duplicate_partition = base.clone();
        let first = duplicate_partition.partitions[0].clone();
        duplicate_partition.partitions.push(first);
        assert!(StaticClusterManager::new(&config, &duplicate_partition).is_err());

        let mut unknown_disk = base.clone();
        unknown_disk.partitions[0].replicas[0].mount_path = "/missing".into();
        assert!(StaticClusterManager::new(&config, &unknown_disk).is_err());

        let mut twice_on_node = base.clone();
        let replica = twice_on_node.partitions[0].replicas[0].clone();
        twice_on_node.partitions[0].replicas.push(replica);
        assert!(twice_on_node.validate().is_err());

        let mut duplicate_node = base;
        let node = duplicate_node.datacenters[0].nodes[0].clone();
        duplicate_node.datacenters[1].nodes.push(node);
        assert!(duplicate_node.validate().is_err());
    }

    #[test]
    fn test_layout_json_roundtrip() {
        let layout = test_utils::layout();
        let json = serde_json::to_string(&layout).unwrap();
        let parsed: StaticLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, layout);

        let minimal = r#"{
            "cluster_name": "blobmap",
            "datacenters": [{"name": "DC0", "id": 0, "nodes": [
                {"hostname": "localhost", "port": 6667,
                 "disks": [{"mount_path": "/mnt0", "capacity_bytes": 1024}]}
            ]}],
            "partitions": [{"id": 0, "state": "READ_ONLY",
                "replicas": [{"hostname": "localhost", "port": 6667, "mount_path": "/mnt0"}]}]
        }"#;
        let layout: StaticLayout = serde_json::from_str(minimal).unwrap();
        let map = StaticClusterManager::new(&ClusterMapConfig::default(), &layout).unwrap();
        let partitions = map.get_all_partition_ids(Some("default"));
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].state(), PartitionState::ReadOnly);
    }

    #[test]
    fn test_instance_records_mirror_layout() {
        let layout = test_utils::layout();
        let records = layout.to_instance_records(Some(3));
        assert_eq!(records.len(), 2);
        let dc0 = &records["DC0"];
        assert_eq!(dc0.len(), 3);
        assert!(dc0.iter().all(|r| r.xid == Some(3) && r.datacenter == "DC0"));

        let placed: usize = dc0
            .iter()
            .flat_map(|r| &r.disks)
            .map(|d| d.replicas.len())
            .sum();
        assert_eq!(placed, test_utils::TOTAL_PARTITIONS * test_utils::REPLICAS_PER_DC);
        let sealed: usize = dc0.iter().map(|r| r.sealed_replicas.len()).sum();
        assert_eq!(
            sealed,
            (test_utils::DEFAULT_RO + test_utils::SPECIAL_RO) * test_utils::REPLICAS_PER_DC
        );
    }
}
