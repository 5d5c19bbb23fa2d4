//! Liveness tracking for nodes, disks and replicas
//!
//! Every physical resource carries a [`FailureTracker`] holding only its own
//! layer's counters. The cascade from node to disk to replica is computed on
//! read by walking back-references (see [`Replica::is_down`]), so a node
//! timing out takes down everything beneath it without touching the disk or
//! replica counters.
//!
//! Two event paths drive the trackers:
//! - [`apply_replica_event`]: threshold-based, one signal per request outcome
//! - [`apply_server_error`]: forced transitions for server error codes the
//!   network layer already trusts more than a retry count

use crate::topology::Replica;
use blobmap_common::{ReplicaEventType, ServerErrorCode};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default)]
struct TrackerState {
    /// Consecutive failures since the last success
    failures: u32,
    /// Threshold crossed (or forced down by a server error)
    tripped: bool,
    /// Marked down by the coordination service's live-instance signal
    hard_down: bool,
}

impl TrackerState {
    const fn is_down(self) -> bool {
        self.tripped || self.hard_down
    }
}

/// Converts a stream of failure/success signals into a binary down state
#[derive(Debug)]
pub struct FailureTracker {
    threshold: u32,
    state: Mutex<TrackerState>,
}

impl FailureTracker {
    /// Create a tracker that trips after `threshold` consecutive failures
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Failure threshold
    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Consecutive failures recorded since the last reset
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.state.lock().failures
    }

    /// Whether this layer considers itself down
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.state.lock().is_down()
    }

    /// Record a failure. Returns true if this failure tripped the tracker.
    pub fn on_error(&self) -> bool {
        let mut state = self.state.lock();
        state.failures = state.failures.saturating_add(1);
        if !state.tripped && state.failures >= self.threshold {
            state.tripped = true;
            return !state.hard_down;
        }
        false
    }

    /// Record a success, resetting the counter. Returns true if the resource
    /// came back up.
    pub fn on_success(&self) -> bool {
        let mut state = self.state.lock();
        let was_down = state.is_down();
        state.failures = 0;
        state.tripped = false;
        was_down && !state.is_down()
    }

    /// Mark down immediately, bypassing the threshold
    pub fn force_down(&self) -> bool {
        let mut state = self.state.lock();
        let was_down = state.is_down();
        state.failures = state.failures.max(self.threshold);
        state.tripped = true;
        !was_down
    }

    /// Apply the live-instance signal. Returns true if the flag changed.
    ///
    /// Coming back from a hard down starts from a clean counter.
    pub fn set_hard_down(&self, hard_down: bool) -> bool {
        let mut state = self.state.lock();
        if state.hard_down == hard_down {
            return false;
        }
        state.hard_down = hard_down;
        if !hard_down {
            state.failures = 0;
            state.tripped = false;
        }
        true
    }
}

/// Drive the threshold state machine with a request outcome
pub(crate) fn apply_replica_event(replica: &Replica, event: ReplicaEventType) {
    let node = replica.data_node();
    let disk = replica.disk();
    match event {
        ReplicaEventType::NodeTimeout => {
            if node.tracker().on_error() {
                warn!(
                    "Data node {} marked unavailable after {} consecutive timeouts",
                    node.instance_name(),
                    node.tracker().threshold()
                );
            }
        }
        ReplicaEventType::NodeResponseOk => {
            if node.tracker().on_success() {
                info!("Data node {} is available again", node.instance_name());
            }
        }
        ReplicaEventType::DiskError => {
            if disk.tracker().on_error() {
                warn!(
                    "Disk {} on {} marked unavailable after {} consecutive errors",
                    disk.mount_path(),
                    node.instance_name(),
                    disk.tracker().threshold()
                );
            }
        }
        ReplicaEventType::DiskOk => {
            if disk.tracker().on_success() {
                info!(
                    "Disk {} on {} is available again",
                    disk.mount_path(),
                    node.instance_name()
                );
            }
        }
        ReplicaEventType::ReplicaUnavailable => {
            if replica.tracker().on_error() {
                warn!("Replica {} marked down", replica);
            }
        }
        ReplicaEventType::ReplicaAvailable => {
            if replica.tracker().on_success() {
                info!("Replica {} is available again", replica);
            }
        }
        ReplicaEventType::PartitionReadOnly => {}
    }
}

/// Force resource states from a server-reported error code
pub(crate) fn apply_server_error(replica: &Replica, code: ServerErrorCode) {
    let disk = replica.disk();
    match code {
        ServerErrorCode::ReplicaUnavailable => {
            disk.tracker().on_success();
            replica.tracker().force_down();
        }
        ServerErrorCode::DiskUnavailable => {
            disk.tracker().force_down();
        }
        // a disabled replica takes its disk down with it, same as an I/O error
        ServerErrorCode::IoError | ServerErrorCode::TemporarilyDisabled => {
            disk.tracker().force_down();
            replica.tracker().force_down();
        }
        ServerErrorCode::PartitionReadOnly => {
            disk.tracker().on_success();
            replica.tracker().on_success();
        }
        ServerErrorCode::NoError
        | ServerErrorCode::BlobNotFound
        | ServerErrorCode::BlobDeleted
        | ServerErrorCode::BlobExpired
        | ServerErrorCode::UnknownError => return,
    }
    debug!("Applied server error {} to replica {}", code, replica);
}
