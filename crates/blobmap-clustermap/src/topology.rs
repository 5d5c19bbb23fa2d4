//! Cluster topology representation
//!
//! The topology holds datacenters, data nodes, disks, partitions and replicas.
//! Children point at their parents (`Replica -> Disk -> DataNode`) through
//! `Arc`s, and a replica points at its partition through a `Weak`, so there
//! are no reference cycles and the liveness cascade is computed by walking up.
//!
//! Every entity is stamped with the id of the topology that built it. The
//! cluster map facades use the stamp to reject handles that belong to another
//! cluster map instance.

use crate::liveness::FailureTracker;
use crate::partition::Partition;
use blobmap_common::{Error, FailureThresholds, HardwareState, InstanceName, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Datacenter information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datacenter {
    /// Datacenter name
    pub name: String,
    /// Numeric datacenter id
    pub id: u8,
}

/// Identity and placement attributes of a data node
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub hostname: String,
    pub port: u16,
    pub datacenter: String,
    pub rack_id: Option<String>,
    /// xid of the record that introduced the node
    pub xid: Option<i64>,
}

impl NodeSpec {
    /// Canonical instance name for this node
    #[must_use]
    pub fn instance_name(&self) -> InstanceName {
        InstanceName::new(&self.hostname, self.port)
    }
}

/// A storage node
#[derive(Debug)]
pub struct DataNode {
    map_id: u64,
    instance_name: InstanceName,
    spec: NodeSpec,
    tracker: FailureTracker,
    /// Whether the node's replicas have been placed into partitions
    placed: AtomicBool,
}

impl DataNode {
    /// Canonical `{hostname}_{port}` name
    #[must_use]
    pub const fn instance_name(&self) -> &InstanceName {
        &self.instance_name
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.spec.hostname
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.spec.port
    }

    /// Name of the owning datacenter
    #[must_use]
    pub fn datacenter(&self) -> &str {
        &self.spec.datacenter
    }

    #[must_use]
    pub fn rack_id(&self) -> Option<&str> {
        self.spec.rack_id.as_deref()
    }

    #[must_use]
    pub const fn xid(&self) -> Option<i64> {
        self.spec.xid
    }

    /// Id of the cluster map that built this node
    #[must_use]
    pub const fn map_id(&self) -> u64 {
        self.map_id
    }

    #[must_use]
    pub fn state(&self) -> HardwareState {
        HardwareState::from_down(self.is_down())
    }

    #[must_use]
    pub fn is_down(&self) -> bool {
        self.tracker.is_down()
    }

    /// Nodes first seen through an incremental change are registered
    /// without placing their replicas
    #[must_use]
    pub fn replicas_placed(&self) -> bool {
        self.placed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_replicas_placed(&self) {
        self.placed.store(true, Ordering::Release);
    }

    pub(crate) const fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.instance_name)
    }
}

/// A disk on a data node
#[derive(Debug)]
pub struct Disk {
    node: Arc<DataNode>,
    mount_path: String,
    capacity_bytes: u64,
    tracker: FailureTracker,
}

impl Disk {
    #[must_use]
    pub const fn data_node(&self) -> &Arc<DataNode> {
        &self.node
    }

    #[must_use]
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    #[must_use]
    pub const fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Id of the cluster map that built this disk
    #[must_use]
    pub fn map_id(&self) -> u64 {
        self.node.map_id
    }

    /// Down if the disk itself or its node is down
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.node.is_down() || self.tracker.is_down()
    }

    #[must_use]
    pub fn state(&self) -> HardwareState {
        HardwareState::from_down(self.is_down())
    }

    pub(crate) const fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }
}

/// One copy of a partition, placed on a disk of a data node
#[derive(Debug)]
pub struct Replica {
    partition_id: u64,
    partition: Weak<Partition>,
    disk: Arc<Disk>,
    sealed: AtomicBool,
    stopped: AtomicBool,
    tracker: FailureTracker,
}

impl Replica {
    fn new(partition: &Arc<Partition>, disk: Arc<Disk>, threshold: u32, sealed: bool, stopped: bool) -> Self {
        Self {
            partition_id: partition.id(),
            partition: Arc::downgrade(partition),
            disk,
            sealed: AtomicBool::new(sealed),
            stopped: AtomicBool::new(stopped),
            tracker: FailureTracker::new(threshold),
        }
    }

    #[must_use]
    pub const fn partition_id(&self) -> u64 {
        self.partition_id
    }

    /// Owning partition, while the cluster map that built it is alive
    #[must_use]
    pub fn partition(&self) -> Option<Arc<Partition>> {
        self.partition.upgrade()
    }

    #[must_use]
    pub const fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    #[must_use]
    pub fn data_node(&self) -> &Arc<DataNode> {
        &self.disk.node
    }

    /// Id of the cluster map that built this replica
    #[must_use]
    pub fn map_id(&self) -> u64 {
        self.disk.node.map_id
    }

    /// On-disk location of the replica
    #[must_use]
    pub fn replica_path(&self) -> String {
        format!("{}/{}", self.disk.mount_path, self.partition_id)
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Down if the node, the disk, or the replica itself is down, or if the
    /// replica has been stopped
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.is_stopped() || self.disk.is_down() || self.tracker.is_down()
    }

    /// Only the owning partition flips this, under its aggregation lock
    pub(crate) fn store_sealed(&self, sealed: bool) -> bool {
        self.sealed.swap(sealed, Ordering::AcqRel) != sealed
    }

    /// Returns true if the flag changed
    pub(crate) fn set_stopped(&self, stopped: bool) -> bool {
        self.stopped.swap(stopped, Ordering::AcqRel) != stopped
    }

    pub(crate) const fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.disk.node.instance_name, self.disk.mount_path, self.partition_id
        )
    }
}

#[derive(Debug)]
struct NodeEntry {
    node: Arc<DataNode>,
    disks: Vec<Arc<Disk>>,
    replicas: Vec<Arc<Replica>>,
}

/// Cluster topology containing every node, disk, partition and replica known
/// to one cluster map instance
#[derive(Debug)]
pub struct ClusterTopology {
    map_id: u64,
    thresholds: FailureThresholds,
    /// Version number (incremented on structural changes)
    version: AtomicU64,
    datacenters: RwLock<BTreeMap<String, Datacenter>>,
    nodes: DashMap<InstanceName, NodeEntry>,
    partitions: DashMap<u64, Arc<Partition>>,
    /// Sorted copy-on-write list for bulk scans
    partition_list: RwLock<Arc<Vec<Arc<Partition>>>>,
}

impl ClusterTopology {
    /// Create a new empty topology with a fresh map id
    #[must_use]
    pub fn new(thresholds: FailureThresholds) -> Self {
        Self {
            map_id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            thresholds,
            version: AtomicU64::new(0),
            datacenters: RwLock::new(BTreeMap::new()),
            nodes: DashMap::new(),
            partitions: DashMap::new(),
            partition_list: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Id stamped on every entity this topology builds
    #[must_use]
    pub const fn map_id(&self) -> u64 {
        self.map_id
    }

    #[must_use]
    pub const fn thresholds(&self) -> FailureThresholds {
        self.thresholds
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Register a datacenter. Returns false if it was already known.
    pub fn add_datacenter(&self, name: &str, id: u8) -> bool {
        let mut datacenters = self.datacenters.write();
        if datacenters.contains_key(name) {
            return false;
        }
        datacenters.insert(
            name.to_string(),
            Datacenter {
                name: name.to_string(),
                id,
            },
        );
        self.bump_version();
        true
    }

    #[must_use]
    pub fn has_datacenter(&self, name: &str) -> bool {
        self.datacenters.read().contains_key(name)
    }

    #[must_use]
    pub fn datacenter(&self, name: &str) -> Option<Datacenter> {
        self.datacenters.read().get(name).cloned()
    }

    #[must_use]
    pub fn datacenters(&self) -> Vec<Datacenter> {
        self.datacenters.read().values().cloned().collect()
    }

    /// Add a data node, or return the existing node with the same identity.
    /// The flag is true if the node was created.
    pub fn register_node(&self, spec: NodeSpec) -> Result<(Arc<DataNode>, bool)> {
        if !self.has_datacenter(&spec.datacenter) {
            return Err(Error::invalid_record(
                spec.instance_name().as_str(),
                format!("unknown datacenter {}", spec.datacenter),
            ));
        }
        let instance_name = spec.instance_name();
        let mut created = false;
        let node = self
            .nodes
            .entry(instance_name.clone())
            .or_insert_with(|| {
                created = true;
                NodeEntry {
                    node: Arc::new(DataNode {
                        map_id: self.map_id,
                        instance_name,
                        spec,
                        tracker: FailureTracker::new(self.thresholds.datanode),
                        placed: AtomicBool::new(false),
                    }),
                    disks: Vec::new(),
                    replicas: Vec::new(),
                }
            })
            .node
            .clone();
        if created {
            self.bump_version();
        }
        Ok((node, created))
    }

    /// Add a disk to a node, or return the existing disk at the same mount path
    pub fn add_disk(
        &self,
        instance: &InstanceName,
        mount_path: &str,
        capacity_bytes: u64,
    ) -> Result<(Arc<Disk>, bool)> {
        let mut entry = self
            .nodes
            .get_mut(instance)
            .ok_or_else(|| Error::NodeNotFound(instance.to_string()))?;
        if let Some(disk) = entry.disks.iter().find(|d| d.mount_path == mount_path) {
            return Ok((Arc::clone(disk), false));
        }
        let disk = Arc::new(Disk {
            node: Arc::clone(&entry.node),
            mount_path: mount_path.to_string(),
            capacity_bytes,
            tracker: FailureTracker::new(self.thresholds.disk),
        });
        entry.disks.push(Arc::clone(&disk));
        drop(entry);
        self.bump_version();
        Ok((disk, true))
    }

    /// Get a partition by id, creating it if it does not exist yet
    ///
    /// Newly created partitions are reachable by id immediately but only show
    /// up in [`ClusterTopology::partitions`] once published.
    pub fn get_or_create_partition(&self, id: u64, partition_class: &str) -> (Arc<Partition>, bool) {
        let mut created = false;
        let partition = self
            .partitions
            .entry(id)
            .or_insert_with(|| {
                created = true;
                Arc::new(Partition::new(self.map_id, id, partition_class))
            })
            .clone();
        (partition, created)
    }

    /// Make newly created partitions visible to bulk scans
    pub fn publish_partitions(&self, created: &[Arc<Partition>]) {
        if created.is_empty() {
            return;
        }
        let mut list = self.partition_list.write();
        let mut next = Vec::with_capacity(list.len() + created.len());
        next.extend(list.iter().cloned());
        next.extend(created.iter().cloned());
        next.sort_by_key(|p| p.id());
        next.dedup_by_key(|p| p.id());
        *list = Arc::new(next);
        drop(list);
        self.bump_version();
    }

    /// Place a replica of `partition` on a disk of `instance`
    ///
    /// A node hosts at most one replica per partition: if one already exists
    /// it is returned unchanged with the flag set to false, wherever it lives.
    pub fn add_replica(
        &self,
        partition: &Arc<Partition>,
        instance: &InstanceName,
        mount_path: &str,
        sealed: bool,
        stopped: bool,
    ) -> Result<(Arc<Replica>, bool)> {
        let mut entry = self
            .nodes
            .get_mut(instance)
            .ok_or_else(|| Error::NodeNotFound(instance.to_string()))?;
        if let Some(existing) = entry
            .replicas
            .iter()
            .find(|r| r.partition_id == partition.id())
        {
            return Ok((Arc::clone(existing), false));
        }
        let disk = entry
            .disks
            .iter()
            .find(|d| d.mount_path == mount_path)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_record(instance.as_str(), format!("undeclared disk {mount_path}"))
            })?;
        let replica = Arc::new(Replica::new(
            partition,
            disk,
            self.thresholds.replica,
            sealed,
            stopped,
        ));
        entry.replicas.push(Arc::clone(&replica));
        partition.attach_replica(Arc::clone(&replica));
        drop(entry);
        self.bump_version();
        Ok((replica, true))
    }

    /// Get a specific node by instance name
    #[must_use]
    pub fn get_node(&self, instance: &InstanceName) -> Option<Arc<DataNode>> {
        self.nodes.get(instance).map(|e| Arc::clone(&e.node))
    }

    /// Find a node by hostname and port
    #[must_use]
    pub fn find_node(&self, hostname: &str, port: u16) -> Option<Arc<DataNode>> {
        self.get_node(&InstanceName::new(hostname, port))
    }

    /// Get all nodes in the cluster, ordered by instance name
    #[must_use]
    pub fn all_nodes(&self) -> Vec<Arc<DataNode>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|e| Arc::clone(&e.node)).collect();
        nodes.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        nodes
    }

    /// Get all nodes currently available
    #[must_use]
    pub fn active_nodes(&self) -> Vec<Arc<DataNode>> {
        self.all_nodes().into_iter().filter(|n| !n.is_down()).collect()
    }

    /// Get the nodes of one datacenter
    #[must_use]
    pub fn nodes_in_datacenter(&self, datacenter: &str) -> Vec<Arc<DataNode>> {
        self.all_nodes()
            .into_iter()
            .filter(|n| n.datacenter() == datacenter)
            .collect()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Disks of a node, in the order they were added
    #[must_use]
    pub fn disks(&self, instance: &InstanceName) -> Vec<Arc<Disk>> {
        self.nodes
            .get(instance)
            .map(|e| e.disks.clone())
            .unwrap_or_default()
    }

    /// Every disk in the cluster
    #[must_use]
    pub fn all_disks(&self) -> Vec<Arc<Disk>> {
        self.nodes
            .iter()
            .flat_map(|e| e.disks.clone())
            .collect()
    }

    /// Replicas hosted on a node, `None` if the node is unknown
    #[must_use]
    pub fn replicas_on(&self, instance: &InstanceName) -> Option<Vec<Arc<Replica>>> {
        self.nodes.get(instance).map(|e| e.replicas.clone())
    }

    /// The replica of a partition hosted on a node
    #[must_use]
    pub fn replica(&self, instance: &InstanceName, partition_id: u64) -> Option<Arc<Replica>> {
        self.nodes.get(instance).and_then(|e| {
            e.replicas
                .iter()
                .find(|r| r.partition_id == partition_id)
                .cloned()
        })
    }

    #[must_use]
    pub fn get_partition(&self, id: u64) -> Option<Arc<Partition>> {
        self.partitions.get(&id).map(|p| Arc::clone(&p))
    }

    /// Point-in-time list of published partitions, ordered by id
    #[must_use]
    pub fn partitions(&self) -> Arc<Vec<Arc<Partition>>> {
        Arc::clone(&self.partition_list.read())
    }

    /// Published partitions, optionally restricted to a class and to the
    /// writable ones
    #[must_use]
    pub fn select_partitions(&self, partition_class: Option<&str>, writable_only: bool) -> Vec<Arc<Partition>> {
        self.partitions()
            .iter()
            .filter(|p| partition_class.is_none_or(|class| p.partition_class() == class))
            .filter(|p| !writable_only || p.is_writable())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobmap_common::PartitionState;

    fn spec(host: &str, port: u16) -> NodeSpec {
        NodeSpec {
            hostname: host.to_string(),
            port,
            datacenter: "DC0".to_string(),
            rack_id: Some("rack0".to_string()),
            xid: None,
        }
    }

    fn single_replica_topology() -> (ClusterTopology, Arc<Replica>) {
        let topology = ClusterTopology::new(FailureThresholds::default());
        topology.add_datacenter("DC0", 0);
        let (node, _) = topology.register_node(spec("localhost", 6667)).unwrap();
        topology
            .add_disk(node.instance_name(), "/mnt0", 1 << 30)
            .unwrap();
        let (partition, _) = topology.get_or_create_partition(7, "default");
        let (replica, created) = topology
            .add_replica(&partition, node.instance_name(), "/mnt0", false, false)
            .unwrap();
        assert!(created);
        topology.publish_partitions(&[partition]);
        (topology, replica)
    }

    #[test]
    fn test_topology_add_node() {
        let topology = ClusterTopology::new(FailureThresholds::default());
        assert!(topology.add_datacenter("DC0", 0));
        assert!(!topology.add_datacenter("DC0", 0));

        let (node, created) = topology.register_node(spec("localhost", 6667)).unwrap();
        assert!(created);
        assert_eq!(node.instance_name().as_str(), "localhost_6667");
        assert_eq!(node.map_id(), topology.map_id());

        let (again, created) = topology.register_node(spec("localhost", 6667)).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&node, &again));
        assert!(topology.find_node("localhost", 6667).is_some());
        assert!(topology.find_node("localhost", 6668).is_none());
    }

    #[test]
    fn test_node_in_unknown_datacenter_rejected() {
        let topology = ClusterTopology::new(FailureThresholds::default());
        let err = topology.register_node(spec("localhost", 6667)).unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { .. }));
        assert_eq!(topology.node_count(), 0);
    }

    #[test]
    fn test_replica_on_undeclared_disk_rejected() {
        let (topology, replica) = single_replica_topology();
        let instance = replica.data_node().instance_name().clone();
        let (partition, _) = topology.get_or_create_partition(8, "default");
        assert!(topology
            .add_replica(&partition, &instance, "/mnt9", false, false)
            .is_err());
        assert_eq!(partition.replica_count(), 0);
    }

    #[test]
    fn test_one_replica_per_node_and_partition() {
        let (topology, replica) = single_replica_topology();
        let instance = replica.data_node().instance_name().clone();
        topology.add_disk(&instance, "/mnt1", 1 << 30).unwrap();
        let partition = replica.partition().unwrap();
        let (existing, created) = topology
            .add_replica(&partition, &instance, "/mnt1", false, false)
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&existing, &replica));
        assert_eq!(partition.replica_count(), 1);
    }

    #[test]
    fn test_node_down_cascades() {
        let (topology, replica) = single_replica_topology();
        let node = Arc::clone(replica.data_node());
        node.tracker().force_down();
        assert!(replica.disk().is_down());
        assert!(replica.is_down());
        assert_eq!(topology.active_nodes().len(), 0);

        node.tracker().on_success();
        assert!(!replica.disk().is_down());
        assert!(!replica.is_down());
    }

    #[test]
    fn test_stopped_replica_is_down() {
        let (_topology, replica) = single_replica_topology();
        assert!(replica.set_stopped(true));
        assert!(!replica.set_stopped(true));
        assert!(replica.is_down());
        assert!(!replica.data_node().is_down());
        replica.set_stopped(false);
        assert!(!replica.is_down());
    }

    #[test]
    fn test_partition_selection() {
        let (topology, replica) = single_replica_topology();
        let (special, _) = topology.get_or_create_partition(3, "special");
        topology.publish_partitions(&[Arc::clone(&special)]);

        let ids: Vec<u64> = topology.partitions().iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![3, 7]);
        assert_eq!(topology.select_partitions(Some("special"), false).len(), 1);
        assert_eq!(topology.select_partitions(Some("missing"), false).len(), 0);

        let partition = replica.partition().unwrap();
        partition.set_replica_sealed(&replica, true);
        assert_eq!(partition.state(), PartitionState::ReadOnly);
        let writable: Vec<u64> = topology
            .select_partitions(None, true)
            .iter()
            .map(|p| p.id())
            .collect();
        assert_eq!(writable, vec![3]);
    }

    #[test]
    fn test_distinct_map_ids() {
        let a = ClusterTopology::new(FailureThresholds::default());
        let b = ClusterTopology::new(FailureThresholds::default());
        assert_ne!(a.map_id(), b.map_id());
    }

    #[test]
    fn test_components_carry_map_id() {
        let (topology, replica) = single_replica_topology();
        assert_eq!(replica.map_id(), topology.map_id());
        assert_eq!(replica.disk().map_id(), topology.map_id());
        assert_eq!(replica.data_node().map_id(), topology.map_id());
    }

    #[test]
    fn test_replica_display() {
        let (_topology, replica) = single_replica_topology();
        assert_eq!(replica.to_string(), "localhost_6667:/mnt0/7");
        assert_eq!(replica.replica_path(), "/mnt0/7");
    }
}
