//! Applies coordination service callbacks to the topology
//!
//! Records are filtered against a transaction id floor: a record is applied
//! only if its xid is at or below the floor, and records without an xid are
//! always applied. Records above the floor are dropped and counted; they are
//! picked up only if the coordination service delivers them again after the
//! floor has been raised.
//!
//! A failure in one record is logged and counted and never aborts the rest of
//! its batch.

use crate::coordination::{ClusterChangeListener, InstanceRecord};
use crate::metrics::ClusterMapMetrics;
use crate::partition::Partition;
use crate::topology::{ClusterTopology, DataNode, NodeSpec};
use blobmap_common::{Error, InstanceName, Result};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, error, info, warn};

/// Outcome of applying one batch of records
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records merged into the topology
    pub applied: usize,
    /// Records dropped for an xid above the floor
    pub ignored: usize,
    /// Records rejected with an error
    pub failed: usize,
    /// Nodes created by this batch
    pub nodes_added: usize,
}

/// Whether replicas of a newly seen node are placed into partitions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NewNodeMode {
    /// Snapshot: build the node with its disks and replicas
    Full,
    /// Incremental: register the node and its disks only
    RegisterOnly,
}

/// Applies snapshots and incremental changes to a [`ClusterTopology`]
#[derive(Debug)]
pub struct ChangeIngestor {
    topology: Arc<ClusterTopology>,
    metrics: Arc<ClusterMapMetrics>,
    current_xid: AtomicI64,
    default_partition_class: String,
}

impl ChangeIngestor {
    #[must_use]
    pub fn new(
        topology: Arc<ClusterTopology>,
        metrics: Arc<ClusterMapMetrics>,
        current_xid: i64,
        default_partition_class: &str,
    ) -> Self {
        Self {
            topology,
            metrics,
            current_xid: AtomicI64::new(current_xid),
            default_partition_class: default_partition_class.to_string(),
        }
    }

    /// Current transaction id floor
    #[must_use]
    pub fn current_xid(&self) -> i64 {
        self.current_xid.load(Ordering::Acquire)
    }

    /// Raise the floor. Lower values are ignored.
    pub fn advance_xid(&self, xid: i64) {
        let previous = self.current_xid.fetch_max(xid, Ordering::AcqRel);
        if xid > previous {
            info!("Advanced xid floor from {} to {}", previous, xid);
        }
    }

    /// Whether a record may be applied under the current floor
    #[must_use]
    pub fn is_applicable(&self, record: &InstanceRecord) -> bool {
        record.xid.is_none_or(|xid| xid <= self.current_xid())
    }

    /// Build or merge a datacenter's full record set
    pub fn apply_snapshot(&self, datacenter: &str, records: &[InstanceRecord]) -> IngestSummary {
        self.metrics.record_instance_config_change();
        let summary = self.apply_batch(datacenter, records, NewNodeMode::Full);
        info!(
            "Applied snapshot for {}: {} applied, {} excluded by xid, {} failed",
            datacenter, summary.applied, summary.ignored, summary.failed
        );
        summary
    }

    /// Merge records that changed since the last delivery
    pub fn apply_incremental(&self, datacenter: &str, records: &[InstanceRecord]) -> IngestSummary {
        self.metrics.record_instance_config_change();
        let summary = self.apply_batch(datacenter, records, NewNodeMode::RegisterOnly);
        debug!(
            "Applied incremental change for {}: {:?}",
            datacenter, summary
        );
        summary
    }

    /// Hard down every node of the datacenter missing from `live`, hard up the rest
    pub fn apply_live_instances(&self, datacenter: &str, live: &[InstanceName]) {
        self.metrics.record_live_instance_change();
        let live: HashSet<&InstanceName> = live.iter().collect();
        for node in self.topology.nodes_in_datacenter(datacenter) {
            let is_live = live.contains(node.instance_name());
            if node.tracker().set_hard_down(!is_live) {
                if is_live {
                    info!("Data node {} is live again", node.instance_name());
                } else {
                    warn!("Data node {} is no longer live", node.instance_name());
                }
            }
        }
    }

    fn apply_batch(&self, datacenter: &str, records: &[InstanceRecord], mode: NewNodeMode) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for record in records {
            if !self.is_applicable(record) {
                self.metrics.record_xid_ahead_ignored();
                summary.ignored += 1;
                info!(
                    "Ignoring record for {} with xid {:?} ahead of current xid {}",
                    record.instance_name(),
                    record.xid,
                    self.current_xid()
                );
                continue;
            }
            match self.apply_record(datacenter, record, mode) {
                Ok(created) => {
                    summary.applied += 1;
                    if created {
                        summary.nodes_added += 1;
                    }
                }
                Err(e) => {
                    self.metrics.record_apply_error();
                    summary.failed += 1;
                    error!(
                        "Failed to apply record for {} in {}: {}",
                        record.instance_name(),
                        datacenter,
                        e
                    );
                }
            }
        }
        summary
    }

    /// Returns true if the record introduced a new node
    fn apply_record(&self, datacenter: &str, record: &InstanceRecord, mode: NewNodeMode) -> Result<bool> {
        let instance = record.instance_name();
        validate_record(datacenter, record)?;

        if let Some(node) = self.topology.get_node(&instance) {
            if node.datacenter() != datacenter {
                return Err(Error::invalid_record(
                    instance.as_str(),
                    format!("node already belongs to {}", node.datacenter()),
                ));
            }
            self.merge_node(&node, record, mode)?;
            return Ok(false);
        }

        let (node, created) = self.topology.register_node(NodeSpec {
            hostname: record.hostname.clone(),
            port: record.port,
            datacenter: datacenter.to_string(),
            rack_id: record.rack_id.clone(),
            xid: record.xid,
        })?;
        for disk in &record.disks {
            self.topology
                .add_disk(&instance, &disk.mount_path, disk.capacity_bytes)?;
        }
        match mode {
            NewNodeMode::Full => {
                self.place_replicas(&node, record)?;
                node.mark_replicas_placed();
            }
            NewNodeMode::RegisterOnly => {
                info!(
                    "Registered new data node {} in {} with {} disks; its replicas are not placed",
                    instance,
                    datacenter,
                    record.disks.len()
                );
            }
        }
        Ok(created)
    }

    /// Diff an existing node against a record and apply only the deltas
    ///
    /// A node registered from an incremental change keeps its replicas
    /// unplaced until a snapshot includes it.
    fn merge_node(&self, node: &Arc<DataNode>, record: &InstanceRecord, mode: NewNodeMode) -> Result<()> {
        let instance = node.instance_name();
        for disk in &record.disks {
            let (_, created) = self
                .topology
                .add_disk(instance, &disk.mount_path, disk.capacity_bytes)?;
            if created {
                info!("Added disk {} to data node {}", disk.mount_path, instance);
            }
        }
        if mode == NewNodeMode::Full || node.replicas_placed() {
            self.place_replicas(node, record)?;
            node.mark_replicas_placed();
        }
        Ok(())
    }

    /// Place the record's replicas on the node and sync sealed and stopped flags
    fn place_replicas(&self, node: &Arc<DataNode>, record: &InstanceRecord) -> Result<()> {
        let instance = node.instance_name();
        let sealed = parse_partition_paths(instance, &record.sealed_replicas);
        let stopped = parse_partition_paths(instance, &record.stopped_replicas);
        let mut created_partitions: Vec<Arc<Partition>> = Vec::new();
        let mut outcome = Ok(());

        'disks: for disk in &record.disks {
            for replica in &disk.replicas {
                let class = if replica.partition_class.is_empty() {
                    self.default_partition_class.as_str()
                } else {
                    replica.partition_class.as_str()
                };
                let (partition, created) = self
                    .topology
                    .get_or_create_partition(replica.partition_id, class);
                if created {
                    created_partitions.push(Arc::clone(&partition));
                } else if partition.partition_class() != class {
                    warn!(
                        "Partition {} is class {} but {} lists it as {}",
                        partition.id(),
                        partition.partition_class(),
                        instance,
                        class
                    );
                }
                match self.topology.add_replica(
                    &partition,
                    instance,
                    &disk.mount_path,
                    sealed.contains(&partition.id()),
                    stopped.contains(&partition.id()),
                ) {
                    Ok((placed, false)) if placed.disk().mount_path() != disk.mount_path => {
                        warn!(
                            "Replica {} cannot move to {}; keeping current placement",
                            placed, disk.mount_path
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        outcome = Err(e);
                        break 'disks;
                    }
                }
            }
        }
        // partitions created before a failure still have replicas to show
        self.topology.publish_partitions(&created_partitions);
        outcome?;

        let Some(replicas) = self.topology.replicas_on(instance) else {
            return Ok(());
        };
        for replica in replicas {
            let want_sealed = sealed.contains(&replica.partition_id());
            if let Some(partition) = replica.partition() {
                if partition.set_replica_sealed(&replica, want_sealed) {
                    info!(
                        "Replica {} is now {}",
                        replica,
                        if want_sealed { "sealed" } else { "unsealed" }
                    );
                }
            }
            let want_stopped = stopped.contains(&replica.partition_id());
            if replica.set_stopped(want_stopped) {
                info!(
                    "Replica {} is now {}",
                    replica,
                    if want_stopped { "stopped" } else { "started" }
                );
            }
        }
        Ok(())
    }
}

fn validate_record(datacenter: &str, record: &InstanceRecord) -> Result<()> {
    let instance = record.instance_name();
    if record.hostname.is_empty() || record.port == 0 {
        return Err(Error::invalid_record(instance.as_str(), "missing hostname or port"));
    }
    if record.datacenter != datacenter {
        return Err(Error::invalid_record(
            instance.as_str(),
            format!(
                "record names datacenter {} but was delivered for {}",
                record.datacenter, datacenter
            ),
        ));
    }
    let mut mounts = HashSet::new();
    for disk in &record.disks {
        if !mounts.insert(disk.mount_path.as_str()) {
            return Err(Error::invalid_record(
                instance.as_str(),
                format!("disk {} declared twice", disk.mount_path),
            ));
        }
    }
    Ok(())
}

fn parse_partition_paths(instance: &InstanceName, paths: &[String]) -> BTreeSet<u64> {
    paths
        .iter()
        .filter_map(|path| match path.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Ignoring malformed partition path {:?} on {}", path, instance);
                None
            }
        })
        .collect()
}

/// Routes one datacenter's callbacks into a shared [`ChangeIngestor`]
#[derive(Debug)]
pub struct DatacenterListener {
    datacenter: String,
    ingestor: Arc<ChangeIngestor>,
}

impl DatacenterListener {
    #[must_use]
    pub fn new(datacenter: &str, ingestor: Arc<ChangeIngestor>) -> Self {
        Self {
            datacenter: datacenter.to_string(),
            ingestor,
        }
    }

    fn check_datacenter(&self, datacenter: &str) -> bool {
        if datacenter == self.datacenter {
            return true;
        }
        error!(
            "Listener for {} received a callback for {}",
            self.datacenter, datacenter
        );
        false
    }
}

impl ClusterChangeListener for DatacenterListener {
    fn on_snapshot(&self, datacenter: &str, records: &[InstanceRecord]) {
        if self.check_datacenter(datacenter) {
            self.ingestor.apply_snapshot(datacenter, records);
        }
    }

    fn on_incremental_change(&self, datacenter: &str, records: &[InstanceRecord]) {
        if self.check_datacenter(datacenter) {
            self.ingestor.apply_incremental(datacenter, records);
        }
    }

    fn on_live_instance_change(&self, datacenter: &str, live_instances: &[InstanceName]) {
        if self.check_datacenter(datacenter) {
            self.ingestor.apply_live_instances(datacenter, live_instances);
        }
    }
}
