//! Document replica driven by the ordered operation stream.
//!
//! A [`Replica`] starts from a [`BootstrapView`] and then consumes live
//! sequenced operations. Ordering and deduplication are decided on sequence
//! numbers alone through a [`DeliveryBuffer`]; the [`DocumentModel`] only ever
//! sees each operation once, in order.

use mergeline_proto::{BootstrapView, ClientId, DocumentId, Operation, SequencedOperation};
use thiserror::Error;

use crate::delivery::{Admission, DeliveryBuffer, DeliveryError};

/// Document semantics plugged into a replica.
///
/// The relay treats payloads as opaque; a model gives them meaning on the
/// client side. Models must be deterministic: applying the same operations
/// in the same order from the same state yields the same rendering.
pub trait DocumentModel: Sized {
    /// Model-specific failure (e.g. an undecodable payload).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Rebuild state from a snapshot blob. An empty blob is the empty document.
    fn restore(state: &[u8]) -> Result<Self, Self::Error>;

    /// Apply one operation.
    fn apply(&mut self, op: &Operation) -> Result<(), Self::Error>;

    /// Render current state for comparison across replicas.
    fn render(&self) -> String;
}

/// Result of offering an operation to a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// This many operations were applied (the offered one plus any it
    /// unblocked).
    Applied(usize),
    /// Already applied or already held; nothing changed.
    Duplicate,
    /// Held until the missing sequence numbers arrive.
    Held {
        /// Sequence number the replica is waiting for
        expected: u64,
    },
}

/// Replica errors.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Bootstrap deltas do not continue the snapshot.
    #[error("bootstrap view has a gap: expected sequence {expected}, found {found}")]
    Gap {
        /// Next sequence number the view should have contained
        expected: u64,
        /// Sequence number found instead
        found: u64,
    },

    /// Operation belongs to another document.
    #[error("operation for document {found} offered to replica of {expected}")]
    WrongDocument {
        /// Replica's document
        expected: String,
        /// Operation's document
        found: String,
    },

    /// Delivery buffer refused the operation.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Model failed to restore or apply.
    #[error("document model: {0}")]
    Model(Box<dyn std::error::Error + Send + Sync>),
}

/// One replica of one document.
#[derive(Debug)]
pub struct Replica<M> {
    client_id: ClientId,
    document_id: DocumentId,
    model: M,
    buffer: DeliveryBuffer,
    applied: Vec<u64>,
}

impl<M: DocumentModel> Replica<M> {
    /// Build a replica from a bootstrap view.
    ///
    /// # Errors
    ///
    /// - [`ReplicaError::Gap`] if the deltas are not contiguous from the
    ///   snapshot.
    /// - [`ReplicaError::Model`] if the snapshot or a delta cannot be applied.
    pub fn bootstrap(
        client_id: ClientId,
        document_id: DocumentId,
        view: &BootstrapView,
    ) -> Result<Self, ReplicaError> {
        let model = M::restore(&view.snapshot.state).map_err(model_error)?;
        let mut replica = Self {
            client_id,
            document_id,
            model,
            buffer: DeliveryBuffer::after(view.snapshot.sequence_number),
            applied: Vec::new(),
        };

        for op in &view.deltas {
            let expected = replica.buffer.next_expected();
            if op.sequence_number != expected {
                return Err(ReplicaError::Gap { expected, found: op.sequence_number });
            }
            replica.receive(op.clone())?;
        }

        Ok(replica)
    }

    /// Offer a live operation.
    ///
    /// # Errors
    ///
    /// [`ReplicaError::WrongDocument`], [`ReplicaError::Delivery`] when too
    /// much is held behind a gap, or [`ReplicaError::Model`].
    pub fn receive(&mut self, op: SequencedOperation) -> Result<ReplicaEvent, ReplicaError> {
        if op.document_id() != &self.document_id {
            return Err(ReplicaError::WrongDocument {
                expected: self.document_id.to_string(),
                found: op.document_id().to_string(),
            });
        }

        match self.buffer.accept(op)? {
            Admission::Duplicate => Ok(ReplicaEvent::Duplicate),
            Admission::Held { expected, .. } => Ok(ReplicaEvent::Held { expected }),
            Admission::Ready(ops) => {
                for ready in &ops {
                    self.model.apply(&ready.operation).map_err(model_error)?;
                    self.applied.push(ready.sequence_number);
                }
                Ok(ReplicaEvent::Applied(ops.len()))
            },
        }
    }

    /// Client that owns this replica.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Highest sequence number applied (or covered by the snapshot).
    pub fn last_applied(&self) -> u64 {
        self.buffer.last_delivered()
    }

    /// Sequence numbers applied since bootstrap, in application order.
    pub fn applied(&self) -> &[u64] {
        &self.applied
    }

    /// Rendered document state.
    pub fn render(&self) -> String {
        self.model.render()
    }

    /// Underlying model.
    pub fn model(&self) -> &M {
        &self.model
    }
}

fn model_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> ReplicaError {
    ReplicaError::Model(Box::new(e))
}
