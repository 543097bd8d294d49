//! Operations, sequenced operations, snapshots and bootstrap views.
//!
//! The relay never looks inside an operation payload. Ordering is carried
//! entirely by the `sequence_number` that the durable log assigns, and every
//! deduplication decision downstream is made on that number alone.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, DocumentId};

/// An edit submitted by a client, before the log has ordered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Document the edit targets (log partition key)
    pub document_id: DocumentId,
    /// Client that authored the edit
    pub client_id: ClientId,
    /// Client-local logical timestamp
    pub client_seq: u64,
    /// Opaque edit payload
    pub payload: Bytes,
}

impl Operation {
    /// Create an operation.
    pub fn new(
        document_id: DocumentId,
        client_id: ClientId,
        client_seq: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self { document_id, client_id, client_seq, payload: payload.into() }
    }
}

/// An operation with its authoritative per-document sequence number.
///
/// # Invariants
///
/// - `sequence_number >= 1`; numbers are gap-free and strictly increasing per
///   document.
/// - Two sequenced operations of the same document with the same number are
///   the same operation (redeliveries), never distinct edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedOperation {
    /// Assigned by the durable log
    pub sequence_number: u64,
    /// The submitted operation
    pub operation: Operation,
}

impl SequencedOperation {
    /// Wrap an operation with its assigned sequence number.
    pub fn new(sequence_number: u64, operation: Operation) -> Self {
        debug_assert!(sequence_number > 0, "sequence numbers start at 1");
        Self { sequence_number, operation }
    }

    /// Document this operation belongs to.
    pub fn document_id(&self) -> &DocumentId {
        &self.operation.document_id
    }
}

/// Document state as of a sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last sequence number folded into `state`
    pub sequence_number: u64,
    /// Opaque serialized state
    pub state: Bytes,
}

impl Snapshot {
    /// Snapshot of a document nobody has written yet.
    pub fn empty() -> Self {
        Self { sequence_number: 0, state: Bytes::new() }
    }

    /// Create a snapshot.
    pub fn new(sequence_number: u64, state: impl Into<Bytes>) -> Self {
        Self { sequence_number, state: state.into() }
    }

    /// Whether this is the synthesized empty snapshot.
    pub fn is_empty(&self) -> bool {
        self.sequence_number == 0 && self.state.is_empty()
    }
}

/// What a joining replica needs to catch up: a snapshot and every operation
/// sequenced after it, up to the moment the join completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapView {
    /// Base state
    pub snapshot: Snapshot,
    /// Operations with `sequence_number > snapshot.sequence_number`, ascending
    /// and gap-free
    pub deltas: Vec<SequencedOperation>,
}

impl BootstrapView {
    /// Last sequence number covered by the view.
    pub fn last_sequence(&self) -> u64 {
        self.deltas.last().map_or(self.snapshot.sequence_number, |op| op.sequence_number)
    }

    /// Whether `deltas` continues the snapshot without gaps or duplicates.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = self.snapshot.sequence_number + 1;
        for op in &self.deltas {
            if op.sequence_number != expected {
                return false;
            }
            expected += 1;
        }
        true
    }
}

/// Acknowledgement that an operation was handed to the durable log.
///
/// Means "accepted for ordering", not "applied". The submitter learns its
/// position only when the sequenced operation comes back on its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionAck {
    /// Document the operation was submitted to
    pub document_id: DocumentId,
    /// Authoring client
    pub client_id: ClientId,
    /// Client-local timestamp of the acknowledged operation
    pub client_seq: u64,
}

impl From<&Operation> for SubmissionAck {
    fn from(op: &Operation) -> Self {
        Self {
            document_id: op.document_id.clone(),
            client_id: op.client_id,
            client_seq: op.client_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(seq: u64) -> SequencedOperation {
        let doc = DocumentId::new("doc").unwrap();
        SequencedOperation::new(seq, Operation::new(doc, 1, seq, vec![seq as u8]))
    }

    #[test]
    fn empty_view_covers_snapshot_only() {
        let view = BootstrapView { snapshot: Snapshot::new(7, vec![1]), deltas: vec![] };
        assert_eq!(view.last_sequence(), 7);
        assert!(view.is_contiguous());
    }

    #[test]
    fn contiguity_detects_gaps_and_duplicates() {
        let view =
            BootstrapView { snapshot: Snapshot::new(2, vec![]), deltas: vec![op(3), op(4), op(5)] };
        assert!(view.is_contiguous());
        assert_eq!(view.last_sequence(), 5);

        let gap = BootstrapView { snapshot: Snapshot::empty(), deltas: vec![op(1), op(3)] };
        assert!(!gap.is_contiguous());

        let dup = BootstrapView { snapshot: Snapshot::empty(), deltas: vec![op(1), op(1)] };
        assert!(!dup.is_contiguous());
    }

    #[test]
    fn empty_snapshot_is_zero() {
        let snapshot = Snapshot::empty();
        assert_eq!(snapshot.sequence_number, 0);
        assert!(snapshot.is_empty());
        assert!(!Snapshot::new(0, vec![1]).is_empty());
    }
}
