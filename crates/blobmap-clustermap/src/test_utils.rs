//! Shared fixtures for cluster map tests

use crate::composite::CompositeClusterManager;
use crate::coordination::InMemoryCoordinator;
use crate::dynamic::DynamicClusterManager;
use crate::static_map::{
    DatacenterLayout, DiskLayout, NodeLayout, PartitionLayout, ReplicaLayout, StaticClusterManager,
    StaticLayout,
};
use blobmap_common::{ClusterMapConfig, DatacenterConfig, InstanceName, PartitionState};
use std::sync::Arc;

pub const CLUSTER_NAME: &str = "blobmap-test";
pub const SPECIAL_CLASS: &str = "specialPartitionClass";
pub const CURRENT_XID: i64 = 64;
pub const BASE_PORT: u16 = 6667;
pub const DATACENTERS: [&str; 2] = ["DC0", "DC1"];
pub const NODES_PER_DC: usize = 3;
pub const DISKS_PER_NODE: usize = 2;
pub const REPLICAS_PER_DC: usize = 3;
pub const DISK_CAPACITY: u64 = 1 << 40;

pub const DEFAULT_RW: usize = 10;
pub const DEFAULT_RO: usize = 10;
pub const SPECIAL_RW: usize = 15;
pub const SPECIAL_RO: usize = 5;
pub const TOTAL_PARTITIONS: usize = DEFAULT_RW + DEFAULT_RO + SPECIAL_RW + SPECIAL_RO;

/// Port of the `node`-th node of the `dc`-th datacenter
pub fn port(dc: usize, node: usize) -> u16 {
    BASE_PORT + u16::try_from(dc * 10 + node).unwrap()
}

pub fn instance(dc: usize, node: usize) -> InstanceName {
    InstanceName::new("localhost", port(dc, node))
}

fn endpoint(dc: usize) -> String {
    format!("localhost:{}", 2200 + dc)
}

/// Layout with every partition replicated on every node of both datacenters
pub fn layout() -> StaticLayout {
    let datacenters = DATACENTERS
        .iter()
        .enumerate()
        .map(|(dc, name)| DatacenterLayout {
            name: (*name).to_string(),
            id: u8::try_from(dc).unwrap(),
            nodes: (0..NODES_PER_DC)
                .map(|node| NodeLayout {
                    hostname: "localhost".into(),
                    port: port(dc, node),
                    rack_id: Some(format!("rack{node}")),
                    disks: (0..DISKS_PER_NODE)
                        .map(|disk| DiskLayout {
                            mount_path: format!("/mnt{disk}"),
                            capacity_bytes: DISK_CAPACITY,
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    let groups = [
        ("", PartitionState::ReadWrite, DEFAULT_RW),
        (SPECIAL_CLASS, PartitionState::ReadWrite, SPECIAL_RW),
        ("", PartitionState::ReadOnly, DEFAULT_RO),
        (SPECIAL_CLASS, PartitionState::ReadOnly, SPECIAL_RO),
    ];
    let mut partitions = Vec::new();
    for (class, state, count) in groups {
        for _ in 0..count {
            let id = partitions.len() as u64;
            let replicas = (0..DATACENTERS.len())
                .flat_map(|dc| (0..REPLICAS_PER_DC).map(move |node| (dc, node)))
                .map(|(dc, node)| ReplicaLayout {
                    hostname: "localhost".into(),
                    port: port(dc, node),
                    mount_path: format!("/mnt{}", (id as usize + node) % DISKS_PER_NODE),
                })
                .collect();
            partitions.push(PartitionLayout {
                id,
                partition_class: class.to_string(),
                state,
                replicas,
            });
        }
    }

    StaticLayout {
        cluster_name: CLUSTER_NAME.into(),
        version: 1,
        datacenters,
        partitions,
    }
}

pub fn config(current_xid: i64) -> ClusterMapConfig {
    ClusterMapConfig {
        cluster_name: CLUSTER_NAME.into(),
        host_name: "localhost".into(),
        datacenter_name: "DC0".into(),
        datacenters: DATACENTERS
            .iter()
            .enumerate()
            .map(|(dc, name)| DatacenterConfig {
                name: (*name).to_string(),
                id: u8::try_from(dc).unwrap(),
                coordination_endpoint: endpoint(dc),
            })
            .collect(),
        current_xid,
        ..ClusterMapConfig::default()
    }
}

/// A layout, a coordinator seeded with the same cluster, and a config
/// pointing at it
pub struct TestCluster {
    pub layout: StaticLayout,
    pub config: ClusterMapConfig,
    pub coordinator: InMemoryCoordinator,
}

impl TestCluster {
    pub fn new(current_xid: i64) -> Self {
        let layout = layout();
        let coordinator = InMemoryCoordinator::new(CLUSTER_NAME);
        for (dc, name) in DATACENTERS.iter().enumerate() {
            coordinator.add_datacenter(name, &endpoint(dc));
        }
        for (dc, records) in layout.to_instance_records(None) {
            coordinator.upsert_records(&dc, records).unwrap();
        }
        Self {
            layout,
            config: config(current_xid),
            coordinator,
        }
    }

    pub fn static_map(&self) -> StaticClusterManager {
        StaticClusterManager::new(&self.config, &self.layout).unwrap()
    }

    pub fn dynamic(&self) -> DynamicClusterManager {
        DynamicClusterManager::new(self.config.clone(), &self.coordinator).unwrap()
    }

    pub fn composite(&self) -> CompositeClusterManager {
        CompositeClusterManager::new(Arc::new(self.static_map()), Arc::new(self.dynamic()))
    }
}
