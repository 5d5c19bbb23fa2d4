//! Coordination service contract
//!
//! The coordination service owns cluster membership and placement. It pushes
//! three callback shapes to every registered listener:
//! - a full snapshot of a datacenter's instance records, once at registration
//! - incremental record changes, in delivery order
//! - the set of instances that are currently live
//!
//! [`InMemoryCoordinator`] implements the contract in-process. Callbacks run on
//! the thread that mutates the coordinator, which gives the same
//! one-thread-per-datacenter ordering a networked backend provides.

use blobmap_common::{DatacenterConfig, Error, InstanceName, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// A replica placement as stated by the coordination service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub partition_id: u64,
    /// Empty means the configured default class
    #[serde(default)]
    pub partition_class: String,
}

/// A disk as stated by the coordination service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub mount_path: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub replicas: Vec<ReplicaRecord>,
}

/// Per-instance configuration record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub hostname: String,
    pub port: u16,
    pub datacenter: String,
    #[serde(default)]
    pub rack_id: Option<String>,
    /// Transaction id of the last write to this record
    #[serde(default)]
    pub xid: Option<i64>,
    #[serde(default)]
    pub disks: Vec<DiskRecord>,
    /// Partition path strings of sealed replicas on this instance
    #[serde(default)]
    pub sealed_replicas: Vec<String>,
    /// Partition path strings of stopped replicas on this instance
    #[serde(default)]
    pub stopped_replicas: Vec<String>,
}

impl InstanceRecord {
    /// Create an empty record for an instance
    #[must_use]
    pub fn new(hostname: &str, port: u16, datacenter: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            datacenter: datacenter.to_string(),
            rack_id: None,
            xid: None,
            disks: Vec::new(),
            sealed_replicas: Vec::new(),
            stopped_replicas: Vec::new(),
        }
    }

    #[must_use]
    pub fn instance_name(&self) -> InstanceName {
        InstanceName::new(&self.hostname, self.port)
    }

    /// Mark the replica of a partition sealed or unsealed
    pub fn set_sealed(&mut self, partition_id: u64, sealed: bool) {
        toggle_path(&mut self.sealed_replicas, partition_id, sealed);
    }

    /// Mark the replica of a partition stopped or started
    pub fn set_stopped(&mut self, partition_id: u64, stopped: bool) {
        toggle_path(&mut self.stopped_replicas, partition_id, stopped);
    }
}

fn toggle_path(list: &mut Vec<String>, partition_id: u64, present: bool) {
    let path = partition_id.to_string();
    let position = list.iter().position(|p| *p == path);
    match (present, position) {
        (true, None) => list.push(path),
        (false, Some(i)) => {
            list.remove(i);
        }
        _ => {}
    }
}

/// Receiver of coordination callbacks for one datacenter
pub trait ClusterChangeListener: Send + Sync {
    /// Full snapshot of the datacenter's records
    fn on_snapshot(&self, datacenter: &str, records: &[InstanceRecord]);

    /// Records that changed since the last delivery
    fn on_incremental_change(&self, datacenter: &str, records: &[InstanceRecord]);

    /// Instances currently connected to the coordination service
    fn on_live_instance_change(&self, datacenter: &str, live_instances: &[InstanceName]);
}

/// A connection to one datacenter's coordination service
pub trait CoordinationSession: Send + Sync {
    /// Register a listener. The snapshot and the current live set are
    /// delivered before this returns.
    fn register_listener(&self, listener: Arc<dyn ClusterChangeListener>) -> Result<()>;

    /// Deregister all listeners of this session. Idempotent.
    fn close(&self);
}

/// Factory for coordination sessions
pub trait CoordinationService: Send + Sync {
    fn connect(
        &self,
        cluster_name: &str,
        instance: &InstanceName,
        datacenter: &DatacenterConfig,
    ) -> Result<Box<dyn CoordinationSession>>;
}

struct DatacenterState {
    endpoint: String,
    records: BTreeMap<InstanceName, InstanceRecord>,
    /// `None` until a live set has been published, meaning every record is live
    live: Option<BTreeSet<InstanceName>>,
    listeners: Vec<(u64, Arc<dyn ClusterChangeListener>)>,
}

impl DatacenterState {
    fn live_list(&self) -> Vec<InstanceName> {
        self.live.as_ref().map_or_else(
            || self.records.keys().cloned().collect(),
            |live| live.iter().cloned().collect(),
        )
    }

    fn listeners(&self) -> Vec<Arc<dyn ClusterChangeListener>> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

struct CoordinatorInner {
    cluster_name: String,
    datacenters: RwLock<HashMap<String, DatacenterState>>,
    registration_failure: Mutex<Option<String>>,
    next_session: AtomicU64,
}

/// In-process coordination service
#[derive(Clone)]
pub struct InMemoryCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl InMemoryCoordinator {
    #[must_use]
    pub fn new(cluster_name: &str) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                cluster_name: cluster_name.to_string(),
                datacenters: RwLock::new(HashMap::new()),
                registration_failure: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Serve a datacenter at an endpoint
    pub fn add_datacenter(&self, name: &str, endpoint: &str) {
        self.inner
            .datacenters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| DatacenterState {
                endpoint: endpoint.to_string(),
                records: BTreeMap::new(),
                live: None,
                listeners: Vec::new(),
            });
    }

    /// Store records and push them to listeners as an incremental change
    pub fn upsert_records(&self, datacenter: &str, records: Vec<InstanceRecord>) -> Result<()> {
        let listeners = {
            let mut datacenters = self.inner.datacenters.write();
            let state = datacenters
                .get_mut(datacenter)
                .ok_or_else(|| Error::coordination(format!("unknown datacenter {datacenter}")))?;
            for record in &records {
                state.records.insert(record.instance_name(), record.clone());
            }
            state.listeners()
        };
        for listener in listeners {
            listener.on_incremental_change(datacenter, &records);
        }
        Ok(())
    }

    /// Edit one stored record and push every record of the datacenter, the
    /// way a configuration write is broadcast
    pub fn update_record<F>(&self, instance: &InstanceName, edit: F) -> Result<()>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let (datacenter, records, listeners) = {
            let mut datacenters = self.inner.datacenters.write();
            let (name, state) = datacenters
                .iter_mut()
                .find(|(_, state)| state.records.contains_key(instance))
                .ok_or_else(|| Error::NodeNotFound(instance.to_string()))?;
            if let Some(record) = state.records.get_mut(instance) {
                edit(record);
            }
            (
                name.clone(),
                state.records.values().cloned().collect::<Vec<_>>(),
                state.listeners(),
            )
        };
        debug!("Broadcasting {} records for {}", records.len(), datacenter);
        for listener in listeners {
            listener.on_incremental_change(&datacenter, &records);
        }
        Ok(())
    }

    /// Push every stored record of a datacenter again as an incremental change
    pub fn trigger_incremental_change(&self, datacenter: &str) -> Result<()> {
        let (records, listeners) = self.snapshot_of(datacenter)?;
        for listener in listeners {
            listener.on_incremental_change(datacenter, &records);
        }
        Ok(())
    }

    /// Deliver a full snapshot again, as happens after a reconnect
    pub fn redeliver_snapshot(&self, datacenter: &str) -> Result<()> {
        let (records, listeners) = self.snapshot_of(datacenter)?;
        for listener in listeners {
            listener.on_snapshot(datacenter, &records);
        }
        Ok(())
    }

    /// Publish the live set of a datacenter
    pub fn set_live_instances(&self, datacenter: &str, live: &[InstanceName]) -> Result<()> {
        let listeners = {
            let mut datacenters = self.inner.datacenters.write();
            let state = datacenters
                .get_mut(datacenter)
                .ok_or_else(|| Error::coordination(format!("unknown datacenter {datacenter}")))?;
            state.live = Some(live.iter().cloned().collect());
            state.listeners()
        };
        for listener in listeners {
            listener.on_live_instance_change(datacenter, live);
        }
        Ok(())
    }

    /// Remove an instance from its datacenter's live set
    pub fn bring_instance_down(&self, instance: &InstanceName) -> Result<()> {
        self.set_instance_live(instance, false)
    }

    /// Add an instance back to its datacenter's live set
    pub fn bring_instance_up(&self, instance: &InstanceName) -> Result<()> {
        self.set_instance_live(instance, true)
    }

    fn set_instance_live(&self, instance: &InstanceName, live: bool) -> Result<()> {
        let (datacenter, mut live_set) = {
            let datacenters = self.inner.datacenters.read();
            let (name, state) = datacenters
                .iter()
                .find(|(_, state)| state.records.contains_key(instance))
                .ok_or_else(|| Error::NodeNotFound(instance.to_string()))?;
            (name.clone(), state.live_list())
        };
        live_set.retain(|i| i != instance);
        if live {
            live_set.push(instance.clone());
        }
        self.set_live_instances(&datacenter, &live_set)
    }

    /// Make every following listener registration fail with `reason`
    pub fn fail_registrations(&self, reason: &str) {
        *self.inner.registration_failure.lock() = Some(reason.to_string());
    }

    /// Stored records of a datacenter
    #[must_use]
    pub fn records(&self, datacenter: &str) -> Vec<InstanceRecord> {
        self.inner
            .datacenters
            .read()
            .get(datacenter)
            .map(|state| state.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of listeners registered for a datacenter
    #[must_use]
    pub fn listener_count(&self, datacenter: &str) -> usize {
        self.inner
            .datacenters
            .read()
            .get(datacenter)
            .map_or(0, |state| state.listeners.len())
    }

    fn snapshot_of(
        &self,
        datacenter: &str,
    ) -> Result<(Vec<InstanceRecord>, Vec<Arc<dyn ClusterChangeListener>>)> {
        let datacenters = self.inner.datacenters.read();
        let state = datacenters
            .get(datacenter)
            .ok_or_else(|| Error::coordination(format!("unknown datacenter {datacenter}")))?;
        Ok((state.records.values().cloned().collect(), state.listeners()))
    }
}

impl CoordinationService for InMemoryCoordinator {
    fn connect(
        &self,
        cluster_name: &str,
        instance: &InstanceName,
        datacenter: &DatacenterConfig,
    ) -> Result<Box<dyn CoordinationSession>> {
        if cluster_name != self.inner.cluster_name {
            return Err(Error::coordination(format!(
                "cluster {cluster_name} not found"
            )));
        }
        let datacenters = self.inner.datacenters.read();
        let state = datacenters.get(&datacenter.name).ok_or_else(|| {
            Error::coordination(format!("datacenter {} not found", datacenter.name))
        })?;
        if state.endpoint != datacenter.coordination_endpoint {
            return Err(Error::coordination(format!(
                "no coordination service at {}",
                datacenter.coordination_endpoint
            )));
        }
        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        info!(
            "Instance {} connected to {} at {} (session {})",
            instance, datacenter.name, datacenter.coordination_endpoint, session_id
        );
        Ok(Box::new(InMemorySession {
            inner: Arc::clone(&self.inner),
            datacenter: datacenter.name.clone(),
            session_id,
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemorySession {
    inner: Arc<CoordinatorInner>,
    datacenter: String,
    session_id: u64,
    closed: AtomicBool,
}

impl CoordinationSession for InMemorySession {
    fn register_listener(&self, listener: Arc<dyn ClusterChangeListener>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::coordination("session is closed"));
        }
        if let Some(reason) = self.inner.registration_failure.lock().clone() {
            return Err(Error::coordination(reason));
        }
        let (records, live) = {
            let mut datacenters = self.inner.datacenters.write();
            let state = datacenters.get_mut(&self.datacenter).ok_or_else(|| {
                Error::coordination(format!("datacenter {} not found", self.datacenter))
            })?;
            state.listeners.push((self.session_id, Arc::clone(&listener)));
            (
                state.records.values().cloned().collect::<Vec<_>>(),
                state.live_list(),
            )
        };
        listener.on_snapshot(&self.datacenter, &records);
        listener.on_live_instance_change(&self.datacenter, &live);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(state) = self.inner.datacenters.write().get_mut(&self.datacenter) {
            state.listeners.retain(|(id, _)| *id != self.session_id);
        }
        debug!("Closed coordination session {} for {}", self.session_id, self.datacenter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ClusterChangeListener for Recorder {
        fn on_snapshot(&self, datacenter: &str, records: &[InstanceRecord]) {
            self.events
                .lock()
                .push(format!("snapshot {datacenter} {}", records.len()));
        }

        fn on_incremental_change(&self, datacenter: &str, records: &[InstanceRecord]) {
            self.events
                .lock()
                .push(format!("change {datacenter} {}", records.len()));
        }

        fn on_live_instance_change(&self, datacenter: &str, live: &[InstanceName]) {
            self.events
                .lock()
                .push(format!("live {datacenter} {}", live.len()));
        }
    }

    fn dc0() -> DatacenterConfig {
        DatacenterConfig {
            name: "DC0".into(),
            id: 0,
            coordination_endpoint: "localhost:2200".into(),
        }
    }

    fn coordinator() -> InMemoryCoordinator {
        let coordinator = InMemoryCoordinator::new("blobmap");
        coordinator.add_datacenter("DC0", "localhost:2200");
        coordinator
            .upsert_records(
                "DC0",
                vec![
                    InstanceRecord::new("localhost", 6667, "DC0"),
                    InstanceRecord::new("localhost", 6668, "DC0"),
                ],
            )
            .unwrap();
        coordinator
    }

    #[test]
    fn test_snapshot_on_registration() {
        let coordinator = coordinator();
        let session = coordinator
            .connect("blobmap", &InstanceName::new("localhost", 1), &dc0())
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        session.register_listener(recorder.clone()).unwrap();
        assert_eq!(
            *recorder.events.lock(),
            vec!["snapshot DC0 2".to_string(), "live DC0 2".to_string()]
        );

        coordinator
            .bring_instance_down(&InstanceName::new("localhost", 6667))
            .unwrap();
        coordinator
            .update_record(&InstanceName::new("localhost", 6668), |r| r.set_sealed(3, true))
            .unwrap();
        let events = recorder.events.lock().clone();
        assert_eq!(events[2], "live DC0 1");
        assert_eq!(events[3], "change DC0 2");
        assert_eq!(coordinator.records("DC0")[1].sealed_replicas, vec!["3".to_string()]);
    }

    #[test]
    fn test_connect_errors() {
        let coordinator = coordinator();
        let instance = InstanceName::new("localhost", 1);
        assert!(coordinator.connect("other", &instance, &dc0()).is_err());

        let mut wrong_endpoint = dc0();
        wrong_endpoint.coordination_endpoint = "localhost:9999".into();
        assert!(coordinator.connect("blobmap", &instance, &wrong_endpoint).is_err());

        coordinator.fail_registrations("beBad");
        let session = coordinator.connect("blobmap", &instance, &dc0()).unwrap();
        let err = session
            .register_listener(Arc::new(Recorder::default()))
            .unwrap_err();
        assert_eq!(err.to_string(), "coordination service error: beBad");
    }

    #[test]
    fn test_close_deregisters() {
        let coordinator = coordinator();
        let session = coordinator
            .connect("blobmap", &InstanceName::new("localhost", 1), &dc0())
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        session.register_listener(recorder.clone()).unwrap();
        assert_eq!(coordinator.listener_count("DC0"), 1);

        session.close();
        session.close();
        assert_eq!(coordinator.listener_count("DC0"), 0);
        coordinator.trigger_incremental_change("DC0").unwrap();
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[test]
    fn test_record_flag_toggles() {
        let mut record = InstanceRecord::new("localhost", 6667, "DC0");
        record.set_sealed(1, true);
        record.set_sealed(1, true);
        record.set_stopped(2, true);
        assert_eq!(record.sealed_replicas, vec!["1".to_string()]);
        record.set_sealed(1, false);
        assert!(record.sealed_replicas.is_empty());
        assert_eq!(record.stopped_replicas, vec!["2".to_string()]);
    }
}
