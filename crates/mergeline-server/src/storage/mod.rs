//! External collaborators: snapshot store, durable ordered log, pub/sub.
//!
//! The relay owns none of these; it depends on the interfaces below. The
//! traits are synchronous like the rest of the storage layer. The only async
//! surface is [`Subscription::recv`], which waits for the next pushed
//! operation.
//!
//! Implementations share state through `Arc`, so clones see the same data.
//!
//! # Panics
//!
//! In-memory implementations may panic if an internal mutex is poisoned
//! (a thread panicked while holding the lock).

mod chaotic;
mod error;
mod memory;
mod redb;
mod sequencer;

pub use chaotic::{ChaoticLog, ChaoticPubSub, ChaoticSnapshotStore};
pub use error::{LogError, StorageError, SubscriptionError, TransportError};
use mergeline_proto::{DocumentId, Operation, SequencedOperation, Snapshot};
pub use memory::{MemoryLog, MemoryPubSub, MemorySnapshotStore};
pub use sequencer::LogSequencer;
use tokio::sync::broadcast;

pub use self::redb::RedbStore;

/// Capacity of the log output and per-document pub/sub channels.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Durable snapshot storage.
pub trait SnapshotStore: Clone + Send + Sync + 'static {
    /// Latest snapshot for a document.
    ///
    /// Returns [`StorageError::NotFound`] when the document has no snapshot;
    /// callers treat that as the empty document, not as a failure.
    fn get(&self, document_id: &DocumentId) -> Result<Snapshot, StorageError>;

    /// Store a snapshot, replacing any previous one.
    ///
    /// Written by compaction, which runs outside the relay.
    fn put(&self, document_id: &DocumentId, snapshot: &Snapshot) -> Result<(), StorageError>;
}

/// Durable ordered log with per-document sequence assignment.
///
/// # Invariants
///
/// - Sequence numbers per document start at 1 and are gap-free.
/// - Entries are FIFO per document; no ordering across documents.
/// - Every appended entry is emitted exactly once on the output stream (in
///   assignment order per document), although a slow consumer may lag.
pub trait DurableLog: Clone + Send + Sync + 'static {
    /// Hand an operation to the log for ordering.
    ///
    /// Returns once the log has accepted the entry. The assigned number is
    /// observed on the output stream, not here.
    fn append(&self, document_id: &DocumentId, operation: Operation) -> Result<(), LogError>;

    /// All entries with `sequence_number > since`, ascending.
    fn read_from(
        &self,
        document_id: &DocumentId,
        since: u64,
    ) -> Result<Vec<SequencedOperation>, LogError>;

    /// Highest assigned sequence number, 0 if the document has no entries.
    fn latest_sequence(&self, document_id: &DocumentId) -> Result<u64, LogError>;

    /// Stream of newly sequenced entries across all documents.
    fn subscribe_output(&self) -> Subscription;
}

/// Cross-process publish/subscribe for sequenced operations.
///
/// Delivery to current subscribers is at-least-once; subscribers dedupe by
/// sequence number.
pub trait PubSub: Clone + Send + Sync + 'static {
    /// Subscribe to a document's channel. Active when this returns.
    fn subscribe(&self, document_id: &DocumentId) -> Result<Subscription, TransportError>;

    /// Publish to a document's channel. Returns the number of subscribers
    /// the message reached (0 if nobody is listening).
    fn publish(
        &self,
        document_id: &DocumentId,
        operation: SequencedOperation,
    ) -> Result<usize, TransportError>;

    /// Documents whose channel currently has at least one subscriber.
    fn active_documents(&self) -> Result<Vec<DocumentId>, TransportError>;
}

/// Receiving end of a log output stream or a pub/sub channel.
///
/// Dropping the subscription releases it.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<SequencedOperation>,
}

impl Subscription {
    /// Wrap a broadcast receiver.
    pub fn new(rx: broadcast::Receiver<SequencedOperation>) -> Self {
        Self { rx }
    }

    /// Wait for the next operation.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::Lagged`] if messages were dropped because this
    ///   receiver fell behind. The stream continues after the gap.
    /// - [`SubscriptionError::Closed`] once every sender is gone.
    pub async fn recv(&mut self) -> Result<SequencedOperation, SubscriptionError> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(n) => SubscriptionError::Lagged(n),
            broadcast::error::RecvError::Closed => SubscriptionError::Closed,
        })
    }

    /// Receive without waiting. `Ok(None)` when nothing is queued.
    pub fn try_recv(&mut self) -> Result<Option<SequencedOperation>, SubscriptionError> {
        match self.rx.try_recv() {
            Ok(op) => Ok(Some(op)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(SubscriptionError::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }
}
