#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

//! In-memory collaborators for tests, simulation, and single-process runs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use mergeline_proto::{DocumentId, Operation, SequencedOperation, Snapshot};
use tokio::sync::broadcast;

use super::{
    CHANNEL_CAPACITY, DurableLog, LogError, LogSequencer, PubSub, SnapshotStore, StorageError,
    Subscription, TransportError,
};

/// In-memory durable log.
///
/// Entries are kept per document in assignment order, so `entries[i]` has
/// sequence number `i + 1`. Appends assign and emit under one lock, which
/// keeps the output stream in sequence order per document.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Mutex<MemoryLogInner>>,
    output: broadcast::Sender<SequencedOperation>,
}

struct MemoryLogInner {
    entries: HashMap<DocumentId, Vec<SequencedOperation>>,
    sequencer: LogSequencer,
}

impl MemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        let (output, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(MemoryLogInner {
                entries: HashMap::new(),
                sequencer: LogSequencer::new(),
            })),
            output,
        }
    }

    /// Number of documents with entries.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn document_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").entries.len()
    }

    /// Total entries across all documents.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn total_entries(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").entries.values().map(Vec::len).sum()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableLog for MemoryLog {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn append(&self, document_id: &DocumentId, operation: Operation) -> Result<(), LogError> {
        let mut guard = self.inner.lock().expect("Mutex poisoned");
        let inner = &mut *guard;

        let stored = inner.entries.get(document_id).map_or(0, Vec::len) as u64;
        let sequence_number = inner.sequencer.next(document_id, || Ok(stored))?;

        if sequence_number != stored + 1 {
            inner.sequencer.clear(document_id);
            return Err(LogError::Conflict {
                document_id: document_id.to_string(),
                expected: sequence_number,
                found: stored + 1,
            });
        }

        let sequenced = SequencedOperation::new(sequence_number, operation);
        inner.entries.entry(document_id.clone()).or_default().push(sequenced.clone());

        // No receivers is fine: nothing is consuming the log yet.
        let _ = self.output.send(sequenced);

        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn read_from(
        &self,
        document_id: &DocumentId,
        since: u64,
    ) -> Result<Vec<SequencedOperation>, LogError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some(entries) = inner.entries.get(document_id) else {
            return Ok(Vec::new());
        };

        let start = (since as usize).min(entries.len());
        Ok(entries[start..].to_vec())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn latest_sequence(&self, document_id: &DocumentId) -> Result<u64, LogError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.entries.get(document_id).map_or(0, Vec::len) as u64)
    }

    fn subscribe_output(&self) -> Subscription {
        Subscription::new(self.output.subscribe())
    }
}

/// In-memory snapshot store.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<Mutex<HashMap<DocumentId, Snapshot>>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn get(&self, document_id: &DocumentId) -> Result<Snapshot, StorageError> {
        self.inner
            .lock()
            .expect("Mutex poisoned")
            .get(document_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn put(&self, document_id: &DocumentId, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").insert(document_id.clone(), snapshot.clone());
        Ok(())
    }
}

/// In-process pub/sub with one broadcast channel per document.
///
/// Channels are created on first subscribe and pruned once their last
/// subscriber is gone.
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    channels: Arc<Mutex<HashMap<DocumentId, broadcast::Sender<SequencedOperation>>>>,
}

impl MemoryPubSub {
    /// Create a pub/sub with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscribers on a document's channel.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn subscriber_count(&self, document_id: &DocumentId) -> usize {
        self.channels
            .lock()
            .expect("Mutex poisoned")
            .get(document_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl PubSub for MemoryPubSub {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn subscribe(&self, document_id: &DocumentId) -> Result<Subscription, TransportError> {
        let mut channels = self.channels.lock().expect("Mutex poisoned");
        let sender = channels
            .entry(document_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(Subscription::new(sender.subscribe()))
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn publish(
        &self,
        document_id: &DocumentId,
        operation: SequencedOperation,
    ) -> Result<usize, TransportError> {
        let mut channels = self.channels.lock().expect("Mutex poisoned");

        let Some(sender) = channels.get(document_id) else {
            return Ok(0);
        };

        if let Ok(reached) = sender.send(operation) {
            Ok(reached)
        } else {
            channels.remove(document_id);
            Ok(0)
        }
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn active_documents(&self) -> Result<Vec<DocumentId>, TransportError> {
        let mut channels = self.channels.lock().expect("Mutex poisoned");
        channels.retain(|_, sender| sender.receiver_count() > 0);
        Ok(channels.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str) -> DocumentId {
        DocumentId::new(name).unwrap()
    }

    fn create_test_op(document: &str, client_seq: u64) -> Operation {
        Operation::new(doc(document), 1, client_seq, vec![client_seq as u8])
    }

    #[test]
    fn test_new_log_is_empty() {
        let log = MemoryLog::new();
        assert_eq!(log.document_count(), 0);
        assert_eq!(log.latest_sequence(&doc("a")).unwrap(), 0);
        assert!(log.read_from(&doc("a"), 0).unwrap().is_empty());
    }

    #[test]
    fn test_append_assigns_from_one() {
        let log = MemoryLog::new();
        for i in 0..5 {
            log.append(&doc("a"), create_test_op("a", i)).unwrap();
        }

        let entries = log.read_from(&doc("a"), 0).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.latest_sequence(&doc("a")).unwrap(), 5);
    }

    #[test]
    fn test_documents_sequence_independently() {
        let log = MemoryLog::new();
        log.append(&doc("a"), create_test_op("a", 0)).unwrap();
        log.append(&doc("b"), create_test_op("b", 0)).unwrap();
        log.append(&doc("a"), create_test_op("a", 1)).unwrap();

        assert_eq!(log.latest_sequence(&doc("a")).unwrap(), 2);
        assert_eq!(log.latest_sequence(&doc("b")).unwrap(), 1);
        assert_eq!(log.total_entries(), 3);
    }

    #[test]
    fn test_read_from_is_exclusive() {
        let log = MemoryLog::new();
        for i in 0..4 {
            log.append(&doc("a"), create_test_op("a", i)).unwrap();
        }

        let tail = log.read_from(&doc("a"), 2).unwrap();
        assert_eq!(tail.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![3, 4]);
        assert!(log.read_from(&doc("a"), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_output_stream_emits_in_order() {
        let log = MemoryLog::new();
        let mut output = log.subscribe_output();

        log.append(&doc("a"), create_test_op("a", 0)).unwrap();
        log.append(&doc("a"), create_test_op("a", 1)).unwrap();

        assert_eq!(output.recv().await.unwrap().sequence_number, 1);
        assert_eq!(output.recv().await.unwrap().sequence_number, 2);
    }

    #[test]
    fn test_snapshot_not_found() {
        let store = MemorySnapshotStore::new();
        assert_eq!(store.get(&doc("a")), Err(StorageError::NotFound("a".to_string())));

        store.put(&doc("a"), &Snapshot::new(3, b"abc".to_vec())).unwrap();
        assert_eq!(store.get(&doc("a")).unwrap().sequence_number, 3);
    }

    #[tokio::test]
    async fn test_pubsub_reaches_subscribers() {
        let pubsub = MemoryPubSub::new();
        let mut first = pubsub.subscribe(&doc("a")).unwrap();
        let mut second = pubsub.subscribe(&doc("a")).unwrap();
        assert_eq!(pubsub.subscriber_count(&doc("a")), 2);

        let op = SequencedOperation::new(1, create_test_op("a", 0));
        assert_eq!(pubsub.publish(&doc("a"), op.clone()).unwrap(), 2);

        assert_eq!(first.recv().await.unwrap(), op);
        assert_eq!(second.recv().await.unwrap(), op);
    }

    #[test]
    fn test_pubsub_prunes_released_channels() {
        let pubsub = MemoryPubSub::new();
        let subscription = pubsub.subscribe(&doc("a")).unwrap();
        drop(subscription);

        assert_eq!(pubsub.subscriber_count(&doc("a")), 0);

        let op = SequencedOperation::new(1, create_test_op("a", 0));
        assert_eq!(pubsub.publish(&doc("a"), op).unwrap(), 0);
        assert_eq!(pubsub.publish(&doc("b"), SequencedOperation::new(1, create_test_op("b", 0))).unwrap(), 0);
    }

    #[test]
    fn test_active_documents_tracks_live_subscribers() {
        let pubsub = MemoryPubSub::new();
        let _a = pubsub.subscribe(&doc("a")).unwrap();
        let b = pubsub.subscribe(&doc("b")).unwrap();
        drop(b);

        assert_eq!(pubsub.active_documents().unwrap(), vec![doc("a")]);
    }
}
