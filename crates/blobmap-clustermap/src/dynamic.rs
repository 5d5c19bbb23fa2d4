//! Cluster map kept current by the coordination service
//!
//! Construction connects to every configured datacenter, registers a listener
//! and applies the snapshot delivered on registration. If any datacenter
//! fails, the sessions opened so far are closed, the `instantiation_failed`
//! gauge is raised and no cluster map is returned.

use crate::cluster_map::{self, ClusterMap};
use crate::coordination::{CoordinationService, CoordinationSession};
use crate::ingest::{ChangeIngestor, DatacenterListener};
use crate::metrics::{ClusterMapMetrics, ClusterMapStats, PrometheusExporter};
use crate::partition::Partition;
use crate::topology::{ClusterTopology, DataNode, Replica};
use blobmap_common::{
    ClusterMapConfig, DatacenterConfig, Error, InstanceName, ReplicaEventType, Result,
    ServerErrorCode,
};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Cluster map backed by a coordination service
pub struct DynamicClusterManager {
    config: ClusterMapConfig,
    topology: Arc<ClusterTopology>,
    ingestor: Arc<ChangeIngestor>,
    metrics: Arc<ClusterMapMetrics>,
    sessions: Mutex<Vec<Box<dyn CoordinationSession>>>,
    closed: AtomicBool,
    exporter: PrometheusExporter,
}

impl DynamicClusterManager {
    /// Connect to every configured datacenter and build the initial topology
    pub fn new(config: ClusterMapConfig, coordinator: &dyn CoordinationService) -> Result<Self> {
        Self::with_metrics(config, coordinator, Arc::new(ClusterMapMetrics::new()))
    }

    /// Like [`DynamicClusterManager::new`], reporting into caller-owned metrics
    /// so a failed construction stays observable
    pub fn with_metrics(
        config: ClusterMapConfig,
        coordinator: &dyn CoordinationService,
        metrics: Arc<ClusterMapMetrics>,
    ) -> Result<Self> {
        if let Err(e) = config.validate() {
            metrics.set_instantiation_failed(true);
            error!("Invalid cluster map configuration: {}", e);
            return Err(Error::initialization(&config.datacenter_name, e));
        }

        let topology = Arc::new(ClusterTopology::new(config.thresholds()));
        for dc in &config.datacenters {
            topology.add_datacenter(&dc.name, dc.id);
        }
        let ingestor = Arc::new(ChangeIngestor::new(
            Arc::clone(&topology),
            Arc::clone(&metrics),
            config.current_xid,
            &config.default_partition_class,
        ));

        let self_instance = InstanceName::from_raw(config.host_name.clone());
        let mut sessions: Vec<Box<dyn CoordinationSession>> = Vec::with_capacity(config.datacenters.len());
        for dc in &config.datacenters {
            match open_session(coordinator, &config.cluster_name, &self_instance, dc, &ingestor) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    for session in &sessions {
                        session.close();
                    }
                    metrics.set_instantiation_failed(true);
                    error!("Cluster map initialization failed for {}: {}", dc.name, e);
                    return Err(Error::initialization(&dc.name, e));
                }
            }
        }

        info!(
            "Cluster map {} initialized: {} datacenters, {} nodes, {} partitions",
            config.cluster_name,
            config.datacenters.len(),
            topology.node_count(),
            topology.partitions().len()
        );
        Ok(Self {
            config,
            topology,
            ingestor,
            metrics,
            sessions: Mutex::new(sessions),
            closed: AtomicBool::new(false),
            exporter: PrometheusExporter::default(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ClusterMapConfig {
        &self.config
    }

    #[must_use]
    pub const fn topology(&self) -> &Arc<ClusterTopology> {
        &self.topology
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<ClusterMapMetrics> {
        &self.metrics
    }

    /// Current transaction id floor
    #[must_use]
    pub fn current_xid(&self) -> i64 {
        self.ingestor.current_xid()
    }

    /// Raise the transaction id floor. Records dropped earlier are applied
    /// only if the coordination service delivers them again.
    pub fn advance_xid(&self, xid: i64) {
        self.ingestor.advance_xid(xid);
    }
}

fn open_session(
    coordinator: &dyn CoordinationService,
    cluster_name: &str,
    self_instance: &InstanceName,
    datacenter: &DatacenterConfig,
    ingestor: &Arc<ChangeIngestor>,
) -> Result<Box<dyn CoordinationSession>> {
    let session = coordinator.connect(cluster_name, self_instance, datacenter)?;
    let listener = Arc::new(DatacenterListener::new(&datacenter.name, Arc::clone(ingestor)));
    if let Err(e) = session.register_listener(listener) {
        session.close();
        return Err(e);
    }
    Ok(session)
}

impl ClusterMap for DynamicClusterManager {
    fn local_datacenter_id(&self) -> Option<u8> {
        self.config.local_datacenter_id()
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
        self.metrics.snapshot(&self.topology)
    }

    fn export_metrics(&self) -> String {
        self.exporter.export(&self.metrics_snapshot())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions: Vec<_> = self.sessions.lock().drain(..).collect();
        for session in &sessions {
            session.close();
        }
        info!(
            "Closed cluster map {} ({} coordination sessions)",
            self.config.cluster_name,
            sessions.len()
        );
    }
}

impl Drop for DynamicClusterManager {
    fn drop(&mut self) {
        self.close();
    }
}
