//! Per-document sequence number assignment.
//!
//! Caches the next sequence number per document, initialized lazily from the
//! backing log. Log implementations call [`LogSequencer::next`] while holding
//! their write lock so assignment and persistence happen as one step.

use std::collections::{HashMap, hash_map::Entry};

use mergeline_proto::DocumentId;

use super::LogError;

/// Sequence assignment cache.
#[derive(Debug, Default)]
pub struct LogSequencer {
    next: HashMap<DocumentId, u64>,
}

impl LogSequencer {
    /// Create an empty sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence number for `document_id`.
    ///
    /// On first use for a document, `load_latest` is called to read the
    /// highest persisted number (0 if none).
    ///
    /// # Invariants
    ///
    /// - Post: returned numbers for one document are consecutive, starting
    ///   at `latest + 1`.
    pub fn next(
        &mut self,
        document_id: &DocumentId,
        load_latest: impl FnOnce() -> Result<u64, LogError>,
    ) -> Result<u64, LogError> {
        let slot = match self.next.entry(document_id.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let latest = load_latest()?;
                tracing::debug!(
                    document_id = %document_id,
                    latest_sequence = latest,
                    "initialized sequencer from log"
                );
                e.insert(latest + 1)
            },
        };

        let assigned = *slot;
        *slot =
            assigned.checked_add(1).ok_or_else(|| LogError::Overflow(document_id.to_string()))?;

        debug_assert!(assigned >= 1);
        Ok(assigned)
    }

    /// Undo the most recent assignment after a failed write.
    pub fn rollback(&mut self, document_id: &DocumentId, assigned: u64) {
        if let Some(next) = self.next.get_mut(document_id)
            && *next == assigned + 1
        {
            *next = assigned;
        }
    }

    /// Settle an assignment once its write has finished.
    ///
    /// Any failure after [`next`](Self::next) returns `assigned` must go
    /// through here, otherwise the following append skips a number. A
    /// conflict drops the cached position entirely; every other error hands
    /// `assigned` back for reuse.
    pub fn settle<T>(
        &mut self,
        document_id: &DocumentId,
        assigned: u64,
        written: Result<T, LogError>,
    ) -> Result<T, LogError> {
        match written {
            Ok(value) => Ok(value),
            Err(e @ LogError::Conflict { .. }) => {
                self.clear(document_id);
                Err(e)
            },
            Err(e) => {
                self.rollback(document_id, assigned);
                Err(e)
            },
        }
    }

    /// Forget a document so the next assignment reloads from the log.
    ///
    /// Called when the log reports a conflict, meaning the cache has drifted
    /// from what is persisted.
    pub fn clear(&mut self, document_id: &DocumentId) -> bool {
        self.next.remove(document_id).is_some()
    }
}
