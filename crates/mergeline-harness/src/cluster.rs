//! Multi-gateway cluster for convergence testing.
//!
//! Several [`Gateway`]s share one durable log, one snapshot store and one
//! pub/sub transport, exactly as separate relay processes would. Each joined
//! session drives a [`Replica`] of a [`TextDocument`]. Tests submit edits
//! through any replica's gateway, [`Cluster::sync`] to let the fanout reach
//! every session, then compare replicas through invariants or a
//! [`ConvergenceLedger`].

use std::time::Duration;

use mergeline_core::{Environment, Replica, ReplicaError};
use mergeline_proto::{DocumentId, Operation, SessionId, Snapshot, SubmissionAck};
use mergeline_server::{
    FanoutBroadcaster, Gateway, GatewayConfig, GatewayError, SessionStream,
    storage::{
        ChaoticPubSub, DurableLog, LogError, MemoryLog, MemoryPubSub, MemorySnapshotStore,
        SnapshotStore, StorageError,
    },
};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    SimEnv,
    invariants::{ClusterSnapshot, ReplicaSnapshot},
    ledger::{ConvergenceLedger, LedgerError},
    model::{ModelError, TextDocument, TextEdit},
};

/// Virtual time a replica may go without catching up during [`Cluster::sync`].
const SYNC_BUDGET: Duration = Duration::from_secs(10);

/// Virtual pause between polls of an idle replica stream.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Gateway type used by the cluster.
pub type SimGateway = Gateway<MemoryLog, MemorySnapshotStore, ChaoticPubSub<MemoryPubSub>>;

/// Cluster errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Gateway index out of range.
    #[error("no gateway {0}")]
    UnknownGateway(usize),

    /// Replica index out of range.
    #[error("no replica {0}")]
    UnknownReplica(usize),

    /// Replica's live stream ended.
    #[error("replica {replica} stream closed at seq {at}")]
    StreamClosed {
        /// Replica index
        replica: usize,
        /// Last applied sequence number
        at: u64,
    },

    /// Replica did not catch up within [`SYNC_BUDGET`] of virtual time.
    #[error("replica {replica} stalled at seq {at} waiting for {waiting_for}")]
    Stalled {
        /// Replica index
        replica: usize,
        /// Last applied sequence number
        at: u64,
        /// Sequence number being synced to
        waiting_for: u64,
    },

    /// Gateway refused a request.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Replica refused an operation.
    #[error(transparent)]
    Replica(#[from] ReplicaError),

    /// Edit could not be encoded.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Durable log read failed.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Snapshot store write failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Ledger refused a round.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Cluster construction parameters.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of gateway instances.
    pub gateways: usize,
    /// Seed for session ids and pub/sub duplication.
    pub seed: u64,
    /// Probability that the pub/sub delivers a publish twice.
    pub duplicate_rate: f64,
    /// Limits applied to every gateway.
    pub gateway: GatewayConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { gateways: 2, seed: 0, duplicate_rate: 0.0, gateway: GatewayConfig::default() }
    }
}

/// One joined session and the replica it feeds.
struct ClusterReplica {
    gateway: usize,
    session_id: SessionId,
    replica: Replica<TextDocument>,
    stream: SessionStream,
    snapshot_sequence: u64,
    next_client_seq: u64,
}

/// Gateways and replicas of a single document.
pub struct Cluster {
    env: SimEnv,
    document_id: DocumentId,
    log: MemoryLog,
    snapshots: MemorySnapshotStore,
    gateways: Vec<SimGateway>,
    replicas: Vec<ClusterReplica>,
    next_client_id: u64,
    fanout: JoinHandle<()>,
}

impl Cluster {
    /// Build the cluster and start its fanout task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(document_id: DocumentId, config: ClusterConfig) -> Self {
        let env = SimEnv::with_seed(config.seed);
        let log = MemoryLog::new();
        let snapshots = MemorySnapshotStore::new();
        let pubsub = ChaoticPubSub::with_seed(MemoryPubSub::new(), config.duplicate_rate, config.seed);

        let fanout =
            tokio::spawn(FanoutBroadcaster::new(log.clone(), pubsub.clone()).run(log.subscribe_output()));

        let gateways = (0..config.gateways)
            .map(|_| {
                Gateway::new(config.gateway.clone(), log.clone(), snapshots.clone(), pubsub.clone())
            })
            .collect();

        Self {
            env,
            document_id,
            log,
            snapshots,
            gateways,
            replicas: Vec::new(),
            next_client_id: 1,
            fanout,
        }
    }

    /// Join a new replica through `gateway`, returning its index.
    pub async fn join(&mut self, gateway: usize) -> Result<usize, ClusterError> {
        let session_id = self.env.random_u64();
        let instance = self.gateways.get(gateway).ok_or(ClusterError::UnknownGateway(gateway))?;

        let joined = instance.join(self.document_id.clone(), session_id).await?;

        let client_id = self.next_client_id;
        self.next_client_id += 1;
        let replica = Replica::bootstrap(client_id, self.document_id.clone(), &joined.view)?;

        tracing::debug!(gateway, session_id, client_id, joined_at = joined.joined_at(), "replica joined");

        self.replicas.push(ClusterReplica {
            gateway,
            session_id,
            replica,
            stream: joined.stream,
            snapshot_sequence: joined.view.snapshot.sequence_number,
            next_client_seq: 1,
        });
        Ok(self.replicas.len() - 1)
    }

    /// Submit an edit on behalf of a replica.
    ///
    /// The edit is not applied locally; the replica sees it when the fanout
    /// delivers it back.
    pub fn submit(&mut self, replica: usize, edit: &TextEdit) -> Result<SubmissionAck, ClusterError> {
        let entry = self.replicas.get_mut(replica).ok_or(ClusterError::UnknownReplica(replica))?;
        let operation = Operation::new(
            self.document_id.clone(),
            entry.replica.client_id(),
            entry.next_client_seq,
            edit.to_payload()?,
        );
        entry.next_client_seq += 1;

        let ack =
            self.gateways[entry.gateway].submit(&self.document_id, entry.session_id, operation)?;
        Ok(ack)
    }

    /// Deliver until every replica has applied everything the log holds.
    pub async fn sync(&mut self) -> Result<u64, ClusterError> {
        let latest = self.log.latest_sequence(&self.document_id)?;
        self.sync_to(latest).await?;
        Ok(latest)
    }

    /// Deliver until every replica has applied `upto`.
    ///
    /// Idle streams are polled on the virtual clock, so a stall is reported
    /// after the same number of polls on every run.
    pub async fn sync_to(&mut self, upto: u64) -> Result<(), ClusterError> {
        for (index, entry) in self.replicas.iter_mut().enumerate() {
            let started = self.env.now();
            while entry.replica.last_applied() < upto {
                let at = entry.replica.last_applied();
                if let Some(op) = entry.stream.try_next() {
                    entry.replica.receive(op)?;
                    continue;
                }
                if entry.stream.is_closed() {
                    return Err(ClusterError::StreamClosed { replica: index, at });
                }
                if self.env.now() - started >= SYNC_BUDGET {
                    return Err(ClusterError::Stalled { replica: index, at, waiting_for: upto });
                }
                self.env.sleep(POLL_INTERVAL).await;
            }
        }
        Ok(())
    }

    /// Leave a replica's session and drop the replica, returning its final
    /// rendering. Later replicas shift down one index.
    pub async fn leave(&mut self, replica: usize) -> Result<String, ClusterError> {
        if replica >= self.replicas.len() {
            return Err(ClusterError::UnknownReplica(replica));
        }
        let entry = self.replicas.remove(replica);
        self.gateways[entry.gateway].leave(entry.session_id).await?;
        Ok(entry.replica.render())
    }

    /// Store a replica's current state as the document snapshot, returning
    /// the sequence number it covers.
    pub fn compact(&self, replica: usize) -> Result<u64, ClusterError> {
        let entry = self.replicas.get(replica).ok_or(ClusterError::UnknownReplica(replica))?;
        let sequence = entry.replica.last_applied();
        let snapshot = Snapshot::new(sequence, entry.replica.model().to_state());
        self.snapshots.put(&self.document_id, &snapshot)?;
        Ok(sequence)
    }

    /// Ledger with one column per current replica, named A, B, C...
    pub fn ledger(&self) -> ConvergenceLedger {
        ConvergenceLedger::new((0..self.replicas.len()).map(replica_name))
            .with_title(self.document_id.as_str())
    }

    /// Record every replica's rendering as one ledger round.
    pub fn record(
        &self,
        ledger: &mut ConvergenceLedger,
        round: u64,
        sequence_number: u64,
        operation: &TextEdit,
    ) -> Result<(), ClusterError> {
        ledger.record(round, sequence_number, operation.to_string(), self.renders())?;
        Ok(())
    }

    /// Observable state for invariant checks.
    pub fn snapshot(&self) -> Result<ClusterSnapshot, ClusterError> {
        let log_sequences =
            self.log.read_from(&self.document_id, 0)?.iter().map(|op| op.sequence_number).collect();

        let replicas = self.replicas.iter().enumerate().map(|(index, entry)| {
            ReplicaSnapshot::new(index, entry.replica.client_id())
                .with_snapshot_sequence(entry.snapshot_sequence)
                .with_applied(entry.replica.applied().to_vec())
                .with_render(entry.replica.render())
        });

        Ok(replicas.fold(ClusterSnapshot::empty().with_log(log_sequences), ClusterSnapshot::with_replica))
    }

    /// Rendering of every replica, in index order.
    pub fn renders(&self) -> Vec<String> {
        self.replicas.iter().map(|entry| entry.replica.render()).collect()
    }

    /// Last sequence number a replica applied.
    pub fn last_applied(&self, replica: usize) -> Option<u64> {
        self.replicas.get(replica).map(|entry| entry.replica.last_applied())
    }

    /// Number of joined replicas.
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Gateway instance.
    pub fn gateway(&self, index: usize) -> Option<&SimGateway> {
        self.gateways.get(index)
    }

    /// Shared durable log.
    pub fn log(&self) -> &MemoryLog {
        &self.log
    }

    /// Simulation environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.fanout.abort();
    }
}

fn replica_name(index: usize) -> String {
    match u8::try_from(index) {
        Ok(i) if i < 26 => char::from(b'A' + i).to_string(),
        _ => format!("R{index}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        DocumentId::new("doc-1").unwrap()
    }

    #[tokio::test]
    async fn replicas_converge_across_gateways() {
        let mut cluster = Cluster::new(doc(), ClusterConfig::default());
        let a = cluster.join(0).await.unwrap();
        let b = cluster.join(1).await.unwrap();

        cluster.submit(a, &TextEdit::insert(0, "hello")).unwrap();
        cluster.submit(b, &TextEdit::insert(5, " world")).unwrap();

        assert_eq!(cluster.sync().await.unwrap(), 2);
        assert_eq!(cluster.renders(), vec!["hello world", "hello world"]);
    }

    #[tokio::test]
    async fn unknown_indices_are_rejected() {
        let mut cluster = Cluster::new(doc(), ClusterConfig::default());

        assert!(matches!(cluster.join(9).await, Err(ClusterError::UnknownGateway(9))));
        assert!(matches!(
            cluster.submit(0, &TextEdit::insert(0, "x")),
            Err(ClusterError::UnknownReplica(0))
        ));
        assert!(matches!(cluster.leave(0).await, Err(ClusterError::UnknownReplica(0))));
    }

    #[tokio::test]
    async fn late_joiner_bootstraps_from_compacted_snapshot() {
        let mut cluster = Cluster::new(doc(), ClusterConfig::default());
        let a = cluster.join(0).await.unwrap();

        for word in ["a", "b", "c"] {
            cluster.submit(a, &TextEdit::insert(usize::MAX, word)).unwrap();
        }
        cluster.sync().await.unwrap();
        assert_eq!(cluster.compact(a).unwrap(), 3);

        cluster.submit(a, &TextEdit::insert(usize::MAX, "d")).unwrap();
        let late = cluster.join(1).await.unwrap();
        cluster.sync().await.unwrap();

        assert_eq!(cluster.renders(), vec!["abcd", "abcd"]);
        let snapshot = cluster.snapshot().unwrap();
        assert_eq!(snapshot.replicas[late].snapshot_sequence, 3);
        assert_eq!(snapshot.replicas[late].applied, vec![4]);
    }

    #[tokio::test]
    async fn leave_returns_final_render() {
        let mut cluster = Cluster::new(doc(), ClusterConfig::default());
        let a = cluster.join(0).await.unwrap();
        cluster.join(0).await.unwrap();

        cluster.submit(a, &TextEdit::insert(0, "x")).unwrap();
        cluster.sync().await.unwrap();

        assert_eq!(cluster.leave(a).await.unwrap(), "x");
        assert_eq!(cluster.replica_count(), 1);
        assert_eq!(cluster.gateway(0).unwrap().session_count(), 1);
    }

    #[tokio::test]
    async fn sync_past_the_log_stalls_on_the_virtual_clock() {
        let mut cluster = Cluster::new(doc(), ClusterConfig::default());
        let a = cluster.join(0).await.unwrap();
        cluster.submit(a, &TextEdit::insert(0, "x")).unwrap();

        let before = cluster.env().now();
        assert!(matches!(
            cluster.sync_to(2).await,
            Err(ClusterError::Stalled { replica: 0, at: 1, waiting_for: 2 })
        ));
        assert!(cluster.env().now() - before >= SYNC_BUDGET);
        assert_eq!(cluster.last_applied(a), Some(1));
    }

    #[tokio::test]
    async fn evicted_replica_reports_closed_stream() {
        let config = ClusterConfig {
            gateway: GatewayConfig { session_inbox_capacity: 1, ..GatewayConfig::default() },
            ..ClusterConfig::default()
        };
        let mut cluster = Cluster::new(doc(), config);
        let a = cluster.join(0).await.unwrap();

        // Nothing drains the replica while these go out, so its inbox overflows.
        for word in ["a", "b", "c", "d"] {
            cluster.submit(a, &TextEdit::insert(usize::MAX, word)).unwrap();
        }
        while cluster.gateway(0).unwrap().session_count() > 0 {
            cluster.env().sleep(POLL_INTERVAL).await;
        }

        assert!(matches!(cluster.sync().await, Err(ClusterError::StreamClosed { replica: 0, .. })));
    }

    #[test]
    fn replica_names() {
        assert_eq!(replica_name(0), "A");
        assert_eq!(replica_name(25), "Z");
        assert_eq!(replica_name(26), "R26");
    }
}
