//! Partitions and their serialized identifier
//!
//! A partition's writability is derived from its replicas: it is read-only as
//! soon as one replica is sealed. The state is recomputed eagerly under a
//! per-partition lock whenever a sealed flag changes and published through an
//! atomic, so readers never wait.

use crate::topology::Replica;
use blobmap_common::{Error, PartitionState, Result};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Version of the partition identifier encoding
pub const PARTITION_ID_VERSION: u16 = 1;

/// Encoded size of a partition identifier: version (2) + id (8)
pub const PARTITION_ID_SIZE: usize = 10;

/// Encode a partition id in its canonical wire form
#[must_use]
pub fn encode_partition_id(id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(PARTITION_ID_SIZE);
    buf.put_u16(PARTITION_ID_VERSION);
    buf.put_u64(id);
    buf.freeze()
}

/// Read one encoded partition identifier from a stream and return the id
pub fn read_partition_number(stream: &mut dyn Read) -> Result<u64> {
    let mut version = [0u8; 2];
    stream.read_exact(&mut version)?;
    let version = u16::from_be_bytes(version);
    if version != PARTITION_ID_VERSION {
        return Err(Error::deserialization(format!(
            "unknown partition id version {version}"
        )));
    }
    let mut id = [0u8; 8];
    stream.read_exact(&mut id)?;
    Ok(u64::from_be_bytes(id))
}

/// A partition and its replicas
#[derive(Debug)]
pub struct Partition {
    map_id: u64,
    id: u64,
    partition_class: String,
    state: AtomicU8,
    replicas: RwLock<Vec<Arc<Replica>>>,
    /// Serializes state recomputation
    aggregation: Mutex<()>,
}

impl Partition {
    pub(crate) fn new(map_id: u64, id: u64, partition_class: &str) -> Self {
        Self {
            map_id,
            id,
            partition_class: partition_class.to_string(),
            state: AtomicU8::new(PartitionState::ReadWrite.as_raw()),
            replicas: RwLock::new(Vec::new()),
            aggregation: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn partition_class(&self) -> &str {
        &self.partition_class
    }

    /// Id of the cluster map that built this partition
    #[must_use]
    pub const fn map_id(&self) -> u64 {
        self.map_id
    }

    #[must_use]
    pub fn state(&self) -> PartitionState {
        PartitionState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.state() == PartitionState::ReadWrite
    }

    /// Replicas in the order they were placed
    #[must_use]
    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        self.replicas.read().clone()
    }

    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.replicas.read().len()
    }

    /// Number of replicas currently reporting down
    #[must_use]
    pub fn down_replica_count(&self) -> usize {
        self.replicas.read().iter().filter(|r| r.is_down()).count()
    }

    /// Whether more than half of the replicas are down
    #[must_use]
    pub fn is_majority_down(&self) -> bool {
        let replicas = self.replicas.read();
        let down = replicas.iter().filter(|r| r.is_down()).count();
        !replicas.is_empty() && down * 2 > replicas.len()
    }

    /// Canonical wire encoding
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        encode_partition_id(self.id)
    }

    /// Name used for the partition in coordination records and on disk
    #[must_use]
    pub fn path_string(&self) -> String {
        self.id.to_string()
    }

    pub(crate) fn attach_replica(&self, replica: Arc<Replica>) {
        let _guard = self.aggregation.lock();
        self.replicas.write().push(replica);
        self.refresh_state();
    }

    /// Set a replica's sealed flag and recompute the partition state.
    /// Returns true if the flag changed.
    pub fn set_replica_sealed(&self, replica: &Replica, sealed: bool) -> bool {
        let _guard = self.aggregation.lock();
        let changed = replica.store_sealed(sealed);
        if changed {
            self.refresh_state();
        }
        changed
    }

    /// Caller holds the aggregation lock
    fn refresh_state(&self) {
        let read_only = self.replicas.read().iter().any(|r| r.is_sealed());
        let state = if read_only {
            PartitionState::ReadOnly
        } else {
            PartitionState::ReadWrite
        };
        self.state.store(state.as_raw(), Ordering::Release);
    }
}

impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Partition {}

impl Hash for Partition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Partition[{}]", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ClusterTopology, NodeSpec};
    use blobmap_common::{FailureThresholds, InstanceName};

    /// One partition with a replica on each of `nodes` nodes
    fn partition_with_replicas(nodes: u16) -> (ClusterTopology, Arc<Partition>) {
        let topology = ClusterTopology::new(FailureThresholds::default());
        topology.add_datacenter("DC0", 0);
        let (partition, _) = topology.get_or_create_partition(42, "default");
        for port in 0..nodes {
            let instance = InstanceName::new("localhost", 6000 + port);
            topology
                .register_node(NodeSpec {
                    hostname: "localhost".into(),
                    port: 6000 + port,
                    datacenter: "DC0".into(),
                    rack_id: None,
                    xid: None,
                })
                .unwrap();
            topology.add_disk(&instance, "/mnt0", 1 << 20).unwrap();
            topology
                .add_replica(&partition, &instance, "/mnt0", false, false)
                .unwrap();
        }
        (topology, partition)
    }

    #[test]
    fn test_encoding_layout() {
        let bytes = encode_partition_id(0x0102_0304_0506_0708);
        assert_eq!(bytes.len(), PARTITION_ID_SIZE);
        assert_eq!(&bytes[..], &[0, 1, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(read_partition_number(&mut &bytes[..]).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = encode_partition_id(5).to_vec();
        bytes[1] = 9;
        let err = read_partition_number(&mut &bytes[..]).unwrap_err();
        assert!(err.is_decode_failure());
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let bytes = encode_partition_id(5);
        let err = read_partition_number(&mut &bytes[..6]).unwrap_err();
        assert!(err.is_decode_failure());
    }

    #[test]
    fn test_sealed_aggregation() {
        let (_topology, partition) = partition_with_replicas(3);
        let replicas = partition.replicas();
        assert_eq!(partition.state(), PartitionState::ReadWrite);

        // one sealed replica is enough
        assert!(partition.set_replica_sealed(&replicas[1], true));
        assert_eq!(partition.state(), PartitionState::ReadOnly);
        assert!(!partition.set_replica_sealed(&replicas[1], true));

        for replica in &replicas {
            partition.set_replica_sealed(replica, true);
        }
        assert_eq!(partition.state(), PartitionState::ReadOnly);

        for replica in &replicas[..2] {
            partition.set_replica_sealed(replica, false);
        }
        assert_eq!(partition.state(), PartitionState::ReadOnly);
        partition.set_replica_sealed(&replicas[2], false);
        assert_eq!(partition.state(), PartitionState::ReadWrite);
    }

    #[test]
    fn test_sealed_replica_attached_later() {
        let (topology, partition) = partition_with_replicas(1);
        let instance = InstanceName::new("localhost", 7000);
        topology
            .register_node(NodeSpec {
                hostname: "localhost".into(),
                port: 7000,
                datacenter: "DC0".into(),
                rack_id: None,
                xid: None,
            })
            .unwrap();
        topology.add_disk(&instance, "/mnt0", 1 << 20).unwrap();
        topology
            .add_replica(&partition, &instance, "/mnt0", true, false)
            .unwrap();
        assert_eq!(partition.state(), PartitionState::ReadOnly);
    }

    #[test]
    fn test_stopped_does_not_change_writability() {
        let (_topology, partition) = partition_with_replicas(3);
        let replicas = partition.replicas();
        replicas[0].set_stopped(true);
        assert!(partition.is_writable());
        assert_eq!(partition.down_replica_count(), 1);
        assert!(!partition.is_majority_down());
        replicas[1].set_stopped(true);
        assert!(partition.is_majority_down());
    }

    #[test]
    fn test_concurrent_sealing_converges() {
        let (_topology, partition) = partition_with_replicas(6);
        let replicas = partition.replicas();
        std::thread::scope(|s| {
            for replica in &replicas {
                let partition = &partition;
                s.spawn(move || {
                    for _ in 0..100 {
                        partition.set_replica_sealed(replica, true);
                        partition.set_replica_sealed(replica, false);
                    }
                });
            }
        });
        assert_eq!(partition.state(), PartitionState::ReadWrite);

        std::thread::scope(|s| {
            for (i, replica) in replicas.iter().enumerate() {
                let partition = &partition;
                s.spawn(move || {
                    partition.set_replica_sealed(replica, i % 2 == 0);
                });
            }
        });
        assert_eq!(partition.state(), PartitionState::ReadOnly);
    }

    #[test]
    fn test_path_string_and_identity() {
        let a = Partition::new(1, 17, "default");
        let b = Partition::new(2, 17, "special");
        assert_eq!(a.path_string(), "17");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "Partition[17]");
    }
}
