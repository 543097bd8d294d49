//! Chaotic collaborator wrappers for fault injection testing
//!
//! Wrappers that randomly fail log and snapshot operations, and randomly
//! redeliver pub/sub messages, to test error surfacing and sequence-number
//! deduplication. All randomness is seeded so chaos runs are reproducible.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{Arc, Mutex};

use mergeline_proto::{DocumentId, Operation, SequencedOperation, Snapshot};

use super::{
    DurableLog, LogError, PubSub, SnapshotStore, StorageError, Subscription, TransportError,
};

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Simple deterministic RNG for chaos injection
///
/// Uses a linear congruential generator (LCG) for fast, deterministic
/// randomness, so chaos tests are reproducible with the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next random value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }

    /// True with probability `rate`
    fn roll(&mut self, rate: f64) -> bool {
        self.next() < rate
    }
}

/// Shared chaos state: rate, RNG, and an operation counter.
#[derive(Clone)]
struct Chaos {
    rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<Mutex<usize>>,
}

impl Chaos {
    fn new(rate: f64, seed: u64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "failure_rate must be between 0.0 and 1.0, got {rate}");

        Self {
            rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Count the operation and decide whether chaos strikes.
    #[allow(clippy::expect_used)]
    fn strike(&self) -> bool {
        *self.operation_count.lock().expect("operation_count mutex poisoned") += 1;
        self.rng.lock().expect("ChaoticRng mutex poisoned").roll(self.rate)
    }

    #[allow(clippy::expect_used)]
    fn operation_count(&self) -> usize {
        *self.operation_count.lock().expect("operation_count mutex poisoned")
    }
}

/// Durable log wrapper that randomly reports the log as unavailable.
///
/// A failed append never reaches the inner log, so no sequence number is
/// consumed.
#[derive(Clone)]
pub struct ChaoticLog<L: DurableLog> {
    inner: L,
    chaos: Chaos,
}

impl<L: DurableLog> ChaoticLog<L> {
    /// Wrap a log with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: L, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Wrap a log with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: L, failure_rate: f64, seed: u64) -> Self {
        Self { inner, chaos: Chaos::new(failure_rate, seed) }
    }

    /// Underlying log (for checking invariants after chaos).
    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Total log operations attempted.
    pub fn operation_count(&self) -> usize {
        self.chaos.operation_count()
    }

    fn injected() -> LogError {
        LogError::Unavailable("chaotic failure injection".to_string())
    }
}

impl<L: DurableLog> DurableLog for ChaoticLog<L> {
    fn append(&self, document_id: &DocumentId, operation: Operation) -> Result<(), LogError> {
        if self.chaos.strike() {
            return Err(Self::injected());
        }
        self.inner.append(document_id, operation)
    }

    fn read_from(
        &self,
        document_id: &DocumentId,
        since: u64,
    ) -> Result<Vec<SequencedOperation>, LogError> {
        if self.chaos.strike() {
            return Err(Self::injected());
        }
        self.inner.read_from(document_id, since)
    }

    fn latest_sequence(&self, document_id: &DocumentId) -> Result<u64, LogError> {
        if self.chaos.strike() {
            return Err(Self::injected());
        }
        self.inner.latest_sequence(document_id)
    }

    fn subscribe_output(&self) -> Subscription {
        self.inner.subscribe_output()
    }
}

/// Snapshot store wrapper that randomly fails with I/O errors.
///
/// Never fabricates `NotFound`: that would silently bootstrap from an empty
/// document.
#[derive(Clone)]
pub struct ChaoticSnapshotStore<S: SnapshotStore> {
    inner: S,
    chaos: Chaos,
}

impl<S: SnapshotStore> ChaoticSnapshotStore<S> {
    /// Wrap a store with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Wrap a store with an explicit seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self { inner, chaos: Chaos::new(failure_rate, seed) }
    }

    /// Underlying store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: SnapshotStore> SnapshotStore for ChaoticSnapshotStore<S> {
    fn get(&self, document_id: &DocumentId) -> Result<Snapshot, StorageError> {
        if self.chaos.strike() {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        self.inner.get(document_id)
    }

    fn put(&self, document_id: &DocumentId, snapshot: &Snapshot) -> Result<(), StorageError> {
        if self.chaos.strike() {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        self.inner.put(document_id, snapshot)
    }
}

/// Pub/sub wrapper that randomly publishes a message twice.
///
/// Models at-least-once delivery. Subscribers must drop the redelivery by
/// sequence number.
#[derive(Clone)]
pub struct ChaoticPubSub<P: PubSub> {
    inner: P,
    chaos: Chaos,
}

impl<P: PubSub> ChaoticPubSub<P> {
    /// Wrap a pub/sub with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `duplicate_rate` is not in [0.0, 1.0]
    pub fn new(inner: P, duplicate_rate: f64) -> Self {
        Self::with_seed(inner, duplicate_rate, DEFAULT_SEED)
    }

    /// Wrap a pub/sub with an explicit seed.
    ///
    /// # Panics
    ///
    /// Panics if `duplicate_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: P, duplicate_rate: f64, seed: u64) -> Self {
        Self { inner, chaos: Chaos::new(duplicate_rate, seed) }
    }

    /// Underlying pub/sub.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Publishes attempted (not counting duplicates).
    pub fn operation_count(&self) -> usize {
        self.chaos.operation_count()
    }
}

impl<P: PubSub> PubSub for ChaoticPubSub<P> {
    fn subscribe(&self, document_id: &DocumentId) -> Result<Subscription, TransportError> {
        self.inner.subscribe(document_id)
    }

    fn publish(
        &self,
        document_id: &DocumentId,
        operation: SequencedOperation,
    ) -> Result<usize, TransportError> {
        let duplicate = self.chaos.strike();
        let reached = self.inner.publish(document_id, operation.clone())?;
        if duplicate {
            tracing::trace!(
                document_id = %document_id,
                sequence_number = operation.sequence_number,
                "chaotic duplicate publish"
            );
            self.inner.publish(document_id, operation)?;
        }
        Ok(reached)
    }

    fn active_documents(&self) -> Result<Vec<DocumentId>, TransportError> {
        self.inner.active_documents()
    }
}
