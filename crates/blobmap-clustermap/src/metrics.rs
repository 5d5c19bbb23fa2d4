//! Cluster map metrics and Prometheus exporter
//!
//! This module provides:
//! - **ClusterMapMetrics**: event counters updated by the change ingestor
//! - **ClusterMapStats**: a point-in-time snapshot combining those counters
//!   with gauges computed from the topology
//! - **MismatchCounters**: per-operation divergence counters of the
//!   consistency-checking view
//! - **PrometheusExporter**: formats all of the above in Prometheus text format
//!
//! # Prometheus Metrics
//!
//! ## Counters
//! - `blobmap_clustermap_instance_config_change_trigger_count` - Record deliveries (snapshot or incremental)
//! - `blobmap_clustermap_live_instance_change_trigger_count` - Live-instance deliveries
//! - `blobmap_clustermap_xid_ahead_ignored_count` - Records dropped for an xid above the floor
//! - `blobmap_clustermap_record_apply_error_count` - Records rejected while applying
//! - `blobmap_clustermap_{operation}_mismatch_count` - Composite view divergences
//!
//! ## Gauges
//! - `blobmap_clustermap_instantiation_failed` - 1 if construction failed
//! - `blobmap_clustermap_datacenter_count`, `data_node_count`, `data_node_down_count`
//! - `blobmap_clustermap_disk_count`, `disk_down_count`, `raw_total_capacity_bytes`
//! - `blobmap_clustermap_partition_count`, `partition_read_write_count`, `partition_sealed_count`
//! - `blobmap_clustermap_is_majority_replicas_down_for_any_partition`
//! - `blobmap_clustermap_data_node_resource_state{instance}` - 1 up, 0 down

use crate::topology::ClusterTopology;
use blobmap_common::InstanceName;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Event counters of one dynamic cluster map
#[derive(Debug, Default)]
pub struct ClusterMapMetrics {
    instance_config_change_trigger_count: AtomicU64,
    live_instance_change_trigger_count: AtomicU64,
    xid_ahead_ignored_count: AtomicU64,
    record_apply_error_count: AtomicU64,
    instantiation_failed: AtomicBool,
}

impl ClusterMapMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_instance_config_change(&self) {
        self.instance_config_change_trigger_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_live_instance_change(&self) {
        self.live_instance_change_trigger_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_xid_ahead_ignored(&self) {
        self.xid_ahead_ignored_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_apply_error(&self) {
        self.record_apply_error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_instantiation_failed(&self, failed: bool) {
        self.instantiation_failed.store(failed, Ordering::Relaxed);
    }

    #[must_use]
    pub fn instance_config_change_trigger_count(&self) -> u64 {
        self.instance_config_change_trigger_count
            .load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn live_instance_change_trigger_count(&self) -> u64 {
        self.live_instance_change_trigger_count
            .load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn xid_ahead_ignored_count(&self) -> u64 {
        self.xid_ahead_ignored_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn record_apply_error_count(&self) -> u64 {
        self.record_apply_error_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn instantiation_failed(&self) -> bool {
        self.instantiation_failed.load(Ordering::Relaxed)
    }

    /// Snapshot the counters and compute the topology gauges
    #[must_use]
    pub fn snapshot(&self, topology: &ClusterTopology) -> ClusterMapStats {
        ClusterMapStats {
            instance_config_change_trigger_count: self.instance_config_change_trigger_count(),
            live_instance_change_trigger_count: self.live_instance_change_trigger_count(),
            xid_ahead_ignored_count: self.xid_ahead_ignored_count(),
            record_apply_error_count: self.record_apply_error_count(),
            instantiation_failed: self.instantiation_failed(),
            ..topology_stats(topology)
        }
    }
}

/// Gauges derived from the topology alone, with zeroed counters
#[must_use]
pub fn topology_stats(topology: &ClusterTopology) -> ClusterMapStats {
    let nodes = topology.all_nodes();
    let disks = topology.all_disks();
    let partitions = topology.partitions();

    ClusterMapStats {
        datacenter_count: topology.datacenters().len() as u64,
        data_node_count: nodes.len() as u64,
        data_node_down_count: nodes.iter().filter(|n| n.is_down()).count() as u64,
        disk_count: disks.len() as u64,
        disk_down_count: disks.iter().filter(|d| d.is_down()).count() as u64,
        raw_total_capacity_bytes: disks.iter().map(|d| d.capacity_bytes()).sum(),
        partition_count: partitions.len() as u64,
        partition_read_write_count: partitions.iter().filter(|p| p.is_writable()).count() as u64,
        partition_sealed_count: partitions.iter().filter(|p| !p.is_writable()).count() as u64,
        is_majority_replicas_down_for_any_partition: partitions
            .iter()
            .any(|p| p.is_majority_down()),
        node_states: nodes
            .iter()
            .map(|n| (n.instance_name().clone(), !n.is_down()))
            .collect(),
        ..ClusterMapStats::default()
    }
}

/// Point-in-time metrics of a cluster map
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterMapStats {
    pub instance_config_change_trigger_count: u64,
    pub live_instance_change_trigger_count: u64,
    pub xid_ahead_ignored_count: u64,
    pub record_apply_error_count: u64,
    pub instantiation_failed: bool,
    pub datacenter_count: u64,
    pub data_node_count: u64,
    pub data_node_down_count: u64,
    pub disk_count: u64,
    pub disk_down_count: u64,
    pub raw_total_capacity_bytes: u64,
    pub partition_count: u64,
    pub partition_read_write_count: u64,
    pub partition_sealed_count: u64,
    pub is_majority_replicas_down_for_any_partition: bool,
    /// Per-node availability (true = up), ordered by instance name
    pub node_states: Vec<(InstanceName, bool)>,
}

/// Read operations cross-checked by the consistency-checking view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckedOperation {
    GetAllPartitionIds,
    GetWritablePartitionIds,
    GetReplicaIds,
    GetPartitionIdFromStream,
    HasDatacenter,
    GetDataNodeId,
    GetDataNodeIds,
}

impl CheckedOperation {
    pub const ALL: [Self; 7] = [
        Self::GetAllPartitionIds,
        Self::GetWritablePartitionIds,
        Self::GetReplicaIds,
        Self::GetPartitionIdFromStream,
        Self::HasDatacenter,
        Self::GetDataNodeId,
        Self::GetDataNodeIds,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GetAllPartitionIds => "get_all_partition_ids",
            Self::GetWritablePartitionIds => "get_writable_partition_ids",
            Self::GetReplicaIds => "get_replica_ids",
            Self::GetPartitionIdFromStream => "get_partition_id_from_stream",
            Self::HasDatacenter => "has_datacenter",
            Self::GetDataNodeId => "get_data_node_id",
            Self::GetDataNodeIds => "get_data_node_ids",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Divergence counters of the consistency-checking view
#[derive(Debug, Default)]
pub struct MismatchCounters {
    counts: [AtomicU64; 7],
}

impl MismatchCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: CheckedOperation) {
        self.counts[operation.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, operation: CheckedOperation) -> u64 {
        self.counts[operation.index()].load(Ordering::Relaxed)
    }

    /// Sum over all operations
    #[must_use]
    pub fn total(&self) -> u64 {
        CheckedOperation::ALL.iter().map(|op| self.get(*op)).sum()
    }
}

/// Prometheus metrics exporter
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "`blobmap_clustermap`")
    prefix: String,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export a cluster map snapshot in Prometheus text format
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn export(&self, stats: &ClusterMapStats) -> String {
        let mut output = String::with_capacity(4 * 1024);

        let counters = [
            (
                "instance_config_change_trigger_count",
                "Instance record deliveries from the coordination service",
                stats.instance_config_change_trigger_count,
            ),
            (
                "live_instance_change_trigger_count",
                "Live instance deliveries from the coordination service",
                stats.live_instance_change_trigger_count,
            ),
            (
                "xid_ahead_ignored_count",
                "Records ignored because their xid is above the local floor",
                stats.xid_ahead_ignored_count,
            ),
            (
                "record_apply_error_count",
                "Records rejected while applying",
                stats.record_apply_error_count,
            ),
        ];
        for (name, help, value) in counters {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "counter");
            self.write_metric(&mut output, name, value as f64);
        }

        let gauges = [
            (
                "instantiation_failed",
                "Whether the cluster map failed to initialize",
                u64::from(stats.instantiation_failed),
            ),
            ("datacenter_count", "Number of datacenters", stats.datacenter_count),
            ("data_node_count", "Number of data nodes", stats.data_node_count),
            (
                "data_node_down_count",
                "Number of unavailable data nodes",
                stats.data_node_down_count,
            ),
            ("disk_count", "Number of disks", stats.disk_count),
            (
                "disk_down_count",
                "Number of unavailable disks",
                stats.disk_down_count,
            ),
            (
                "raw_total_capacity_bytes",
                "Sum of raw disk capacity in bytes",
                stats.raw_total_capacity_bytes,
            ),
            ("partition_count", "Number of partitions", stats.partition_count),
            (
                "partition_read_write_count",
                "Number of read-write partitions",
                stats.partition_read_write_count,
            ),
            (
                "partition_sealed_count",
                "Number of read-only partitions",
                stats.partition_sealed_count,
            ),
            (
                "is_majority_replicas_down_for_any_partition",
                "Whether any partition has a majority of its replicas down",
                u64::from(stats.is_majority_replicas_down_for_any_partition),
            ),
        ];
        for (name, help, value) in gauges {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "gauge");
            self.write_metric(&mut output, name, value as f64);
        }

        if !stats.node_states.is_empty() {
            self.write_help(
                &mut output,
                "data_node_resource_state",
                "Data node availability (1=up, 0=down)",
            );
            self.write_type(&mut output, "data_node_resource_state", "gauge");
            for (instance, up) in &stats.node_states {
                self.write_metric_with_labels(
                    &mut output,
                    "data_node_resource_state",
                    if *up { 1.0 } else { 0.0 },
                    &[("instance", instance.as_str())],
                );
            }
        }

        output
    }

    /// Export the consistency-checking view's divergence counters
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn export_mismatches(&self, mismatches: &MismatchCounters) -> String {
        let mut output = String::with_capacity(1024);
        for operation in CheckedOperation::ALL {
            let name = format!("{}_mismatch_count", operation.as_str());
            self.write_help(
                &mut output,
                &name,
                &format!("Divergent results of {}", operation.as_str()),
            );
            self.write_type(&mut output, &name, "counter");
            self.write_metric(&mut output, &name, mismatches.get(operation) as f64);
        }
        output
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric(&self, output: &mut String, name: &str, value: f64) {
        let _ = writeln!(output, "{}_{} {}", self.prefix, name, value);
    }

    fn write_metric_with_labels(
        &self,
        output: &mut String,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let labels_str: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            labels_str.join(","),
            value
        );
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("blobmap_clustermap")
    }
}
