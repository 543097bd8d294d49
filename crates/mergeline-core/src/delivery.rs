//! In-order delivery of sequenced operations.
//!
//! The durable log assigns gap-free sequence numbers per document, but the
//! pub/sub transport between the log and a gateway is only at-least-once and
//! may reorder under lag. [`DeliveryBuffer`] sits at the receiving end and
//! turns that stream back into a strictly increasing, duplicate-free one.
//!
//! # Invariants
//!
//! - Released operations have consecutive sequence numbers starting at the
//!   anchor given to [`DeliveryBuffer::new`].
//! - An operation is released at most once. Anything at or below
//!   [`DeliveryBuffer::last_delivered`] is reported as a duplicate.
//! - Operations above the next expected number are held, never dropped,
//!   until the gap closes or the hold limit is exceeded.

use std::{collections::BTreeMap, ops::RangeInclusive};

use mergeline_proto::SequencedOperation;
use thiserror::Error;

/// Outcome of offering one operation to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Already released, or already held. Safe to ignore.
    Duplicate,
    /// Above the next expected number; held until the gap fills.
    Held {
        /// Sequence number the buffer is waiting for
        expected: u64,
        /// Sequence number that arrived instead
        received: u64,
    },
    /// The operation (and any held operations it unblocked), in order.
    Ready(Vec<SequencedOperation>),
}

/// Delivery buffer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Too many operations held behind a gap.
    #[error("{held} operations held waiting for sequence {expected} (limit {max})")]
    HoldLimitExceeded {
        /// Sequence number the buffer is waiting for
        expected: u64,
        /// Operations currently held
        held: usize,
        /// Configured limit
        max: usize,
    },
}

/// Reordering window for one document's operation stream.
#[derive(Debug, Clone)]
pub struct DeliveryBuffer {
    next_expected: u64,
    held: BTreeMap<u64, SequencedOperation>,
    max_held: usize,
}

impl DeliveryBuffer {
    /// Default number of operations that may wait behind a gap.
    pub const DEFAULT_MAX_HELD: usize = 4096;

    /// Buffer that releases operations starting at `next_expected`.
    ///
    /// `next_expected` of 0 is treated as 1; sequence numbers start at 1.
    pub fn new(next_expected: u64, max_held: usize) -> Self {
        Self { next_expected: next_expected.max(1), held: BTreeMap::new(), max_held }
    }

    /// Buffer for a stream whose operations up to `last_delivered` are
    /// already accounted for.
    pub fn after(last_delivered: u64) -> Self {
        Self::new(last_delivered.saturating_add(1), Self::DEFAULT_MAX_HELD)
    }

    /// Offer an operation.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::HoldLimitExceeded`] when the operation would have to
    /// be held and the hold limit is already reached. The buffer is left
    /// unchanged; the caller is expected to backfill the missing range.
    pub fn accept(&mut self, op: SequencedOperation) -> Result<Admission, DeliveryError> {
        let seq = op.sequence_number;

        if seq < self.next_expected || self.held.contains_key(&seq) {
            return Ok(Admission::Duplicate);
        }

        if seq > self.next_expected {
            if self.held.len() >= self.max_held {
                return Err(DeliveryError::HoldLimitExceeded {
                    expected: self.next_expected,
                    held: self.held.len(),
                    max: self.max_held,
                });
            }
            self.held.insert(seq, op);
            return Ok(Admission::Held { expected: self.next_expected, received: seq });
        }

        let mut ready = vec![op];
        self.next_expected += 1;
        while let Some(next) = self.held.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected += 1;
        }

        Ok(Admission::Ready(ready))
    }

    /// Next sequence number that will be released.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Highest sequence number released so far (0 if none).
    pub fn last_delivered(&self) -> u64 {
        self.next_expected - 1
    }

    /// Number of operations held behind a gap.
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Sequence numbers that must arrive before anything held is released.
    ///
    /// `None` when nothing is held.
    pub fn missing_range(&self) -> Option<RangeInclusive<u64>> {
        let (&first_held, _) = self.held.first_key_value()?;
        Some(self.next_expected..=first_held - 1)
    }
}
