//! Snapshot bootstrapper.
//!
//! Builds the view a joining replica starts from: the latest snapshot plus
//! every log entry sequenced after it. A missing snapshot means the document
//! has never been compacted and is served as the empty snapshot at 0.

use mergeline_proto::{BootstrapView, DocumentId, SequencedOperation, Snapshot};
use thiserror::Error;

use crate::storage::{DurableLog, LogError, SnapshotStore, StorageError};

/// Bootstrap failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    /// Snapshot store failed for a reason other than "no snapshot".
    #[error("snapshot store failed for document {document_id}: {source}")]
    Storage {
        /// Document being loaded
        document_id: DocumentId,
        /// Store error, verbatim
        source: StorageError,
    },

    /// Durable log could not return the trailing entries.
    #[error("log read failed for document {document_id}: {source}")]
    Log {
        /// Document being loaded
        document_id: DocumentId,
        /// Log error, verbatim
        source: LogError,
    },

    /// The log returned a non-contiguous tail.
    #[error(
        "out-of-order delivery for document {document_id}: expected sequence {expected}, got {found}"
    )]
    OutOfOrderDelivery {
        /// Document being loaded
        document_id: DocumentId,
        /// Next sequence number the view needed
        expected: u64,
        /// Sequence number the log returned instead
        found: u64,
    },
}

/// Produces bootstrap views from a snapshot store and a durable log.
#[derive(Clone)]
pub struct Bootstrapper<S, L> {
    snapshots: S,
    log: L,
}

impl<S: SnapshotStore, L: DurableLog> Bootstrapper<S, L> {
    /// Create a bootstrapper over the given collaborators.
    pub fn new(snapshots: S, log: L) -> Self {
        Self { snapshots, log }
    }

    /// Latest snapshot, or the empty snapshot if none exists.
    pub fn load(&self, document_id: &DocumentId) -> Result<Snapshot, BootstrapError> {
        match self.snapshots.get(document_id) {
            Ok(snapshot) => Ok(snapshot),
            Err(StorageError::NotFound(_)) => {
                tracing::debug!(document_id = %document_id, "no snapshot, starting from empty");
                Ok(Snapshot::empty())
            },
            Err(source) => {
                tracing::warn!(document_id = %document_id, error = %source, "snapshot load failed");
                Err(BootstrapError::Storage { document_id: document_id.clone(), source })
            },
        }
    }

    /// Log entries after `since`, checked to be contiguous.
    pub fn trailing_deltas(
        &self,
        document_id: &DocumentId,
        since: u64,
    ) -> Result<Vec<SequencedOperation>, BootstrapError> {
        let deltas = self
            .log
            .read_from(document_id, since)
            .map_err(|source| BootstrapError::Log { document_id: document_id.clone(), source })?;

        let mut expected = since + 1;
        for op in &deltas {
            if op.sequence_number != expected {
                tracing::error!(
                    document_id = %document_id,
                    expected,
                    found = op.sequence_number,
                    "log returned a gap"
                );
                return Err(BootstrapError::OutOfOrderDelivery {
                    document_id: document_id.clone(),
                    expected,
                    found: op.sequence_number,
                });
            }
            expected += 1;
        }

        Ok(deltas)
    }

    /// Snapshot plus trailing deltas.
    ///
    /// # Invariants
    ///
    /// - Post: `view.is_contiguous()`.
    /// - Post: every entry the log had assigned when `read_from` ran is
    ///   covered by the view.
    pub fn bootstrap(&self, document_id: &DocumentId) -> Result<BootstrapView, BootstrapError> {
        let snapshot = self.load(document_id)?;
        let deltas = self.trailing_deltas(document_id, snapshot.sequence_number)?;

        let view = BootstrapView { snapshot, deltas };
        debug_assert!(view.is_contiguous());

        tracing::debug!(
            document_id = %document_id,
            snapshot_sequence = view.snapshot.sequence_number,
            deltas = view.deltas.len(),
            "bootstrap view assembled"
        );

        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use mergeline_proto::Operation;

    use super::*;
    use crate::storage::{ChaoticSnapshotStore, MemoryLog, MemorySnapshotStore};

    fn doc() -> DocumentId {
        DocumentId::new("doc-1").unwrap()
    }

    fn append(log: &MemoryLog, n: u64) {
        for i in 0..n {
            log.append(&doc(), Operation::new(doc(), 1, i, vec![i as u8])).unwrap();
        }
    }

    #[test]
    fn missing_snapshot_is_empty() {
        let bootstrapper = Bootstrapper::new(MemorySnapshotStore::new(), MemoryLog::new());
        let snapshot = bootstrapper.load(&doc()).unwrap();
        assert_eq!(snapshot, Snapshot::empty());
    }

    #[test]
    fn store_failure_propagates() {
        let store = ChaoticSnapshotStore::new(MemorySnapshotStore::new(), 1.0);
        let bootstrapper = Bootstrapper::new(store, MemoryLog::new());

        let err = bootstrapper.bootstrap(&doc()).unwrap_err();
        assert!(matches!(err, BootstrapError::Storage { .. }));
        assert!(err.to_string().contains("doc-1"));
    }

    #[test]
    fn view_continues_from_snapshot() {
        let store = MemorySnapshotStore::new();
        let log = MemoryLog::new();
        append(&log, 5);
        store.put(&doc(), &Snapshot::new(3, b"abc".to_vec())).unwrap();

        let view = Bootstrapper::new(store, log).bootstrap(&doc()).unwrap();
        assert_eq!(view.snapshot.sequence_number, 3);
        assert_eq!(view.deltas.iter().map(|d| d.sequence_number).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(view.last_sequence(), 5);
    }

    #[test]
    fn empty_document_has_empty_view() {
        let view = Bootstrapper::new(MemorySnapshotStore::new(), MemoryLog::new())
            .bootstrap(&doc())
            .unwrap();
        assert!(view.snapshot.is_empty());
        assert!(view.deltas.is_empty());
    }
}
