//! Redb-backed durable log and snapshot store.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Log
//! entries and snapshots survive restarts; sequence assignment resumes from
//! the highest persisted number.

#![allow(clippy::disallowed_types, reason = "Sequencer cache is locked for microseconds")]

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use mergeline_proto::{DocumentId, Operation, SequencedOperation, Snapshot};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tokio::sync::broadcast;

use super::{
    CHANNEL_CAPACITY, DurableLog, LogError, LogSequencer, SnapshotStore, StorageError,
    Subscription,
};

/// Table: log
/// Key: [document_id bytes][0x00][sequence_number: 8 bytes BE]
/// Value: CBOR-encoded `SequencedOperation`
///
/// Document ids never contain control characters, so the 0x00 separator
/// cannot collide and keys of one document form a contiguous range.
const LOG: TableDefinition<&[u8], &[u8]> = TableDefinition::new("log");

/// Table: snapshots
/// Key: document_id bytes
/// Value: CBOR-encoded `Snapshot`
const SNAPSHOTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("snapshots");

/// Durable log and snapshot store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc). The
/// output stream is process-local: entries appended through this handle (or
/// its clones) are emitted to subscribers after their transaction commits.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    sequencer: Arc<Mutex<LogSequencer>>,
    output: broadcast::Sender<SequencedOperation>,
}

impl RedbStore {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(LOG).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(SNAPSHOTS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        let (output, _) = broadcast::channel(CHANNEL_CAPACITY);

        Ok(Self { db: Arc::new(db), sequencer: Arc::new(Mutex::new(LogSequencer::new())), output })
    }

    /// Highest persisted sequence number for a document.
    fn latest_in<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
        document_id: &DocumentId,
    ) -> Result<u64, LogError> {
        let start = encode_log_key(document_id, 0);
        let end = encode_log_key(document_id, u64::MAX);

        let mut range = table
            .range(start.as_slice()..=end.as_slice())
            .map_err(|e| LogError::Unavailable(e.to_string()))?;

        match range.next_back() {
            Some(entry) => {
                let (key, _) = entry.map_err(|e| LogError::Unavailable(e.to_string()))?;
                decode_log_sequence(key.value())
            },
            None => Ok(0),
        }
    }

    /// Write and commit one entry at an already assigned number.
    fn persist(
        txn: WriteTransaction,
        document_id: &DocumentId,
        sequence_number: u64,
        operation: Operation,
    ) -> Result<SequencedOperation, LogError> {
        let sequenced = {
            let mut table =
                txn.open_table(LOG).map_err(|e| LogError::Unavailable(e.to_string()))?;

            let key = encode_log_key(document_id, sequence_number);
            if table.get(key.as_slice()).map_err(|e| LogError::Unavailable(e.to_string()))?.is_some()
            {
                let found = Self::latest_in(&table, document_id)?;
                tracing::warn!(
                    document_id = %document_id,
                    expected = sequence_number,
                    found,
                    "sequencer cache drifted from persisted log"
                );
                return Err(LogError::Conflict {
                    document_id: document_id.to_string(),
                    expected: sequence_number,
                    found,
                });
            }

            let sequenced = SequencedOperation::new(sequence_number, operation);

            let mut bytes = Vec::new();
            ciborium::into_writer(&sequenced, &mut bytes)
                .map_err(|e| LogError::Serialization(e.to_string()))?;

            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| LogError::Unavailable(e.to_string()))?;

            sequenced
        };

        txn.commit().map_err(|e| LogError::Unavailable(e.to_string()))?;
        Ok(sequenced)
    }
}

impl DurableLog for RedbStore {
    fn append(&self, document_id: &DocumentId, operation: Operation) -> Result<(), LogError> {
        // Held across the write so assignment order equals commit order.
        let mut sequencer = self
            .sequencer
            .lock()
            .map_err(|_| LogError::Unavailable("sequencer lock poisoned".to_string()))?;

        let txn = self.db.begin_write().map_err(|e| LogError::Unavailable(e.to_string()))?;

        let sequence_number = {
            let table = txn.open_table(LOG).map_err(|e| LogError::Unavailable(e.to_string()))?;
            sequencer.next(document_id, || Self::latest_in(&table, document_id))?
        };

        let written = Self::persist(txn, document_id, sequence_number, operation);
        let sequenced = sequencer.settle(document_id, sequence_number, written)?;

        let _ = self.output.send(sequenced);

        Ok(())
    }

    fn read_from(
        &self,
        document_id: &DocumentId,
        since: u64,
    ) -> Result<Vec<SequencedOperation>, LogError> {
        let Some(first) = since.checked_add(1) else {
            return Ok(Vec::new());
        };

        let txn = self.db.begin_read().map_err(|e| LogError::Unavailable(e.to_string()))?;
        let table = txn.open_table(LOG).map_err(|e| LogError::Unavailable(e.to_string()))?;

        let start = encode_log_key(document_id, first);
        let end = encode_log_key(document_id, u64::MAX);

        let mut entries = Vec::new();
        for result in table
            .range(start.as_slice()..=end.as_slice())
            .map_err(|e| LogError::Unavailable(e.to_string()))?
        {
            let (_, value) = result.map_err(|e| LogError::Unavailable(e.to_string()))?;
            let entry: SequencedOperation = ciborium::from_reader(value.value())
                .map_err(|e| LogError::Serialization(e.to_string()))?;
            entries.push(entry);
        }

        Ok(entries)
    }

    fn latest_sequence(&self, document_id: &DocumentId) -> Result<u64, LogError> {
        let txn = self.db.begin_read().map_err(|e| LogError::Unavailable(e.to_string()))?;
        let table = txn.open_table(LOG).map_err(|e| LogError::Unavailable(e.to_string()))?;

        Self::latest_in(&table, document_id)
    }

    fn subscribe_output(&self) -> Subscription {
        Subscription::new(self.output.subscribe())
    }
}

impl SnapshotStore for RedbStore {
    fn get(&self, document_id: &DocumentId) -> Result<Snapshot, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(SNAPSHOTS).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(document_id.as_bytes()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Err(StorageError::NotFound(document_id.to_string())),
        }
    }

    fn put(&self, document_id: &DocumentId, snapshot: &Snapshot) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(SNAPSHOTS).map_err(|e| StorageError::Io(e.to_string()))?;

            let mut bytes = Vec::new();
            ciborium::into_writer(snapshot, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            table
                .insert(document_id.as_bytes(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}

/// Encode `(document_id, sequence_number)` as a log key.
///
/// Layout: [document_id bytes][0x00][sequence_number: 8 bytes BE], so
/// lexicographic order within a document matches numeric order.
fn encode_log_key(document_id: &DocumentId, sequence_number: u64) -> Vec<u8> {
    let id = document_id.as_bytes();
    let mut key = Vec::with_capacity(id.len() + 9);
    key.extend_from_slice(id);
    key.push(0);
    key.extend_from_slice(&sequence_number.to_be_bytes());
    key
}

/// Sequence number from the trailing 8 bytes of a log key.
fn decode_log_sequence(key: &[u8]) -> Result<u64, LogError> {
    let tail = key
        .len()
        .checked_sub(8)
        .and_then(|start| key.get(start..))
        .ok_or_else(|| LogError::Serialization(format!("log key too short: {} bytes", key.len())))?;

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(tail);
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn doc(name: &str) -> DocumentId {
        DocumentId::new(name).unwrap()
    }

    fn create_test_op(document: &str, client_seq: u64) -> Operation {
        Operation::new(doc(document), 7, client_seq, vec![client_seq as u8; 16])
    }

    #[test]
    fn test_log_key_encoding() {
        let key = encode_log_key(&doc("doc-1"), 42);
        assert_eq!(key.len(), 5 + 1 + 8);
        assert_eq!(&key[..5], b"doc-1");
        assert_eq!(key[5], 0);
        assert_eq!(decode_log_sequence(&key).unwrap(), 42);
    }

    #[test]
    fn test_log_keys_sort_numerically() {
        let a = encode_log_key(&doc("d"), 2);
        let b = encode_log_key(&doc("d"), 256);
        assert!(a < b);

        // Prefix documents do not interleave.
        let short = encode_log_key(&doc("d"), u64::MAX);
        let long = encode_log_key(&doc("d0"), 1);
        assert!(short < long);
    }

    #[test]
    fn test_append_sequential() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        for i in 0..3 {
            store.append(&doc("a"), create_test_op("a", i)).unwrap();
        }

        assert_eq!(store.latest_sequence(&doc("a")).unwrap(), 3);
        let seqs: Vec<u64> =
            store.read_from(&doc("a"), 0).unwrap().iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_read_from_skips_other_documents() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        store.append(&doc("a"), create_test_op("a", 0)).unwrap();
        store.append(&doc("ab"), create_test_op("ab", 0)).unwrap();
        store.append(&doc("a"), create_test_op("a", 1)).unwrap();

        let entries = store.read_from(&doc("a"), 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence_number, 2);
        assert_eq!(entries[0].document_id(), &doc("a"));
        assert_eq!(store.latest_sequence(&doc("ab")).unwrap(), 1);
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            store.append(&doc("a"), create_test_op("a", 0)).unwrap();
            store.append(&doc("a"), create_test_op("a", 1)).unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        store.append(&doc("a"), create_test_op("a", 2)).unwrap();

        let seqs: Vec<u64> =
            store.read_from(&doc("a"), 0).unwrap().iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_write_does_not_skip_numbers() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();
        store.append(&doc("a"), create_test_op("a", 0)).unwrap();

        // An entry written behind the sequencer's back makes the next write
        // fail after its number was assigned.
        let stray = SequencedOperation::new(2, create_test_op("a", 99));
        let mut bytes = Vec::new();
        ciborium::into_writer(&stray, &mut bytes).unwrap();
        let txn = store.db.begin_write().unwrap();
        txn.open_table(LOG)
            .unwrap()
            .insert(encode_log_key(&doc("a"), 2).as_slice(), bytes.as_slice())
            .unwrap();
        txn.commit().unwrap();

        let err = store.append(&doc("a"), create_test_op("a", 1)).unwrap_err();
        assert!(matches!(err, LogError::Conflict { expected: 2, found: 2, .. }));

        store.append(&doc("a"), create_test_op("a", 2)).unwrap();
        let seqs: Vec<u64> =
            store.read_from(&doc("a"), 0).unwrap().iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_snapshot_roundtrip_and_not_found() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();

        assert!(matches!(store.get(&doc("a")), Err(StorageError::NotFound(_))));

        let snapshot = Snapshot::new(12, b"hello".to_vec());
        store.put(&doc("a"), &snapshot).unwrap();
        assert_eq!(store.get(&doc("a")).unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_output_emits_after_commit() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("test.redb")).unwrap();
        let mut output = store.subscribe_output();

        store.append(&doc("a"), create_test_op("a", 0)).unwrap();

        let emitted = output.recv().await.unwrap();
        assert_eq!(emitted.sequence_number, 1);
        assert_eq!(store.read_from(&doc("a"), 0).unwrap()[0], emitted);
    }
}
