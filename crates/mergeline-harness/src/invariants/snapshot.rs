//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture what the log and every replica show at one instant.
//! Invariants run against snapshots rather than live state so each check
//! sees a single consistent picture.

use mergeline_proto::ClientId;

/// Snapshot of the whole cluster for one document.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    /// Sequence numbers held by the durable log, in log order.
    pub log_sequences: Vec<u64>,
    /// Per-replica state.
    pub replicas: Vec<ReplicaSnapshot>,
}

impl ClusterSnapshot {
    /// Snapshot with an empty log and no replicas.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set the log contents.
    pub fn with_log(mut self, sequences: Vec<u64>) -> Self {
        self.log_sequences = sequences;
        self
    }

    /// Add a replica snapshot.
    pub fn with_replica(mut self, replica: ReplicaSnapshot) -> Self {
        self.replicas.push(replica);
        self
    }
}

/// Snapshot of one replica.
#[derive(Debug, Clone, Default)]
pub struct ReplicaSnapshot {
    /// Position of the replica in the cluster.
    pub index: usize,
    /// Client the replica belongs to.
    pub client_id: ClientId,
    /// Sequence number of the snapshot it bootstrapped from.
    pub snapshot_sequence: u64,
    /// Sequence numbers applied after the snapshot, in application order.
    pub applied: Vec<u64>,
    /// Rendered document.
    pub render: String,
}

impl ReplicaSnapshot {
    /// Replica that bootstrapped from the empty document.
    pub fn new(index: usize, client_id: ClientId) -> Self {
        Self { index, client_id, ..Default::default() }
    }

    /// Set the bootstrap snapshot sequence.
    pub fn with_snapshot_sequence(mut self, sequence: u64) -> Self {
        self.snapshot_sequence = sequence;
        self
    }

    /// Set the applied sequence numbers.
    pub fn with_applied(mut self, applied: Vec<u64>) -> Self {
        self.applied = applied;
        self
    }

    /// Set the rendered document.
    pub fn with_render(mut self, render: impl Into<String>) -> Self {
        self.render = render.into();
        self
    }

    /// Highest sequence number reflected in the render.
    pub fn last_applied(&self) -> u64 {
        self.applied.last().copied().unwrap_or(self.snapshot_sequence)
    }
}
