//! Connection gateway.
//!
//! Owns the live sessions of one gateway instance and the document rooms
//! they are joined to. A join subscribes the room before asking for the
//! snapshot, so no operation sequenced during the bootstrap window can slip
//! between the view and the live stream: anything the room delivers while the
//! view is assembled is merged into the view's deltas, deduplicated by
//! sequence number, and the live stream continues strictly above it.
//!
//! # Invariants
//!
//! - A room exists exactly while it has at least one local member; the last
//!   leave (or eviction) releases its subscription.
//! - A failed join leaves no session or room behind.
//! - For every joined session, `view.deltas` followed by the session stream
//!   is gap-free from `view.snapshot.sequence_number + 1`.

#![allow(clippy::disallowed_types, reason = "Registry lock is never held across an await")]

use std::sync::{Mutex, MutexGuard};

use mergeline_proto::{
    BootstrapView, DocumentId, Operation, SequencedOperation, SessionId, SubmissionAck,
};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    bootstrap::{BootstrapError, Bootstrapper},
    ingress::{IngressError, OpIngress},
    registry::RoomRegistry,
    room::{Evicted, RoomClient, RoomHandle},
    storage::{DurableLog, LogError, PubSub, SnapshotStore},
};

/// Gateway limits.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum concurrently joined sessions
    pub max_sessions: usize,
    /// Buffered operations per session before it is evicted
    pub session_inbox_capacity: usize,
    /// Command inbox size of each room task
    pub room_inbox_capacity: usize,
    /// Largest accepted operation payload, in bytes
    pub max_payload_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            session_inbox_capacity: 256,
            room_inbox_capacity: 1024,
            max_payload_size: 1024 * 1024,
        }
    }
}

/// Gateway errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Snapshot store, log, or pub/sub failed while joining.
    #[error("document {document_id} unavailable: {reason}")]
    DocumentUnavailable {
        /// Document being joined
        document_id: DocumentId,
        /// Collaborator error
        reason: String,
    },

    /// Log refused a submitted operation.
    #[error("log unavailable for document {document_id}: {source}")]
    LogUnavailable {
        /// Target document
        document_id: DocumentId,
        /// Log error, verbatim
        source: LogError,
    },

    /// Session unknown to this gateway.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// Session id already registered.
    #[error("session {0} already joined")]
    SessionAlreadyJoined(SessionId),

    /// Submit named a different document than the session joined.
    #[error("session {session_id} joined {joined}, not {requested}")]
    DocumentMismatch {
        /// Submitting session
        session_id: SessionId,
        /// Document the session joined
        joined: DocumentId,
        /// Document the submit named
        requested: DocumentId,
    },

    /// Gateway at session capacity.
    #[error("session capacity of {max} reached")]
    CapacityExceeded {
        /// Configured limit
        max: usize,
    },

    /// Operation failed validation.
    #[error("invalid operation for document {document_id}: {reason}")]
    InvalidOperation {
        /// Target document
        document_id: DocumentId,
        /// What was wrong
        reason: String,
    },

    /// The view and the live stream did not line up.
    #[error(
        "out-of-order delivery for document {document_id}: expected sequence {expected}, got {found}"
    )]
    OutOfOrderDelivery {
        /// Document being joined
        document_id: DocumentId,
        /// Next sequence number needed
        expected: u64,
        /// Sequence number seen instead
        found: u64,
    },
}

impl From<BootstrapError> for GatewayError {
    fn from(err: BootstrapError) -> Self {
        match err {
            BootstrapError::Storage { document_id, source } => {
                Self::DocumentUnavailable { document_id, reason: source.to_string() }
            },
            BootstrapError::Log { document_id, source } => {
                Self::DocumentUnavailable { document_id, reason: source.to_string() }
            },
            BootstrapError::OutOfOrderDelivery { document_id, expected, found } => {
                Self::OutOfOrderDelivery { document_id, expected, found }
            },
        }
    }
}

impl From<IngressError> for GatewayError {
    fn from(err: IngressError) -> Self {
        match err {
            IngressError::InvalidOperation { document_id, reason } => {
                Self::InvalidOperation { document_id, reason }
            },
            IngressError::LogUnavailable { document_id, source } => {
                Self::LogUnavailable { document_id, source }
            },
        }
    }
}

/// A completed join.
#[derive(Debug)]
pub struct Joined {
    /// The joined session
    pub session_id: SessionId,
    /// Snapshot plus every operation up to `joined_at`
    pub view: BootstrapView,
    /// Live operations above the view
    pub stream: SessionStream,
}

impl Joined {
    /// Last sequence number covered by the view.
    pub fn joined_at(&self) -> u64 {
        self.view.last_sequence()
    }
}

/// Live operation stream of one session.
///
/// Ends when the session leaves, is evicted for falling behind, or its room
/// stops.
#[derive(Debug)]
pub struct SessionStream {
    session_id: SessionId,
    rx: mpsc::Receiver<SequencedOperation>,
    watermark: u64,
}

impl SessionStream {
    /// Next operation above everything already yielded.
    pub async fn next(&mut self) -> Option<SequencedOperation> {
        while let Some(operation) = self.rx.recv().await {
            if let Some(operation) = self.advance(operation) {
                return Some(operation);
            }
        }
        None
    }

    /// Next queued operation, without waiting.
    pub fn try_next(&mut self) -> Option<SequencedOperation> {
        while let Ok(operation) = self.rx.try_recv() {
            if let Some(operation) = self.advance(operation) {
                return Some(operation);
            }
        }
        None
    }

    /// Whether the stream has ended and nothing is left to yield.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }

    /// Session this stream belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Highest sequence number yielded (or covered by the view).
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    fn advance(&mut self, operation: SequencedOperation) -> Option<SequencedOperation> {
        if operation.sequence_number <= self.watermark {
            return None;
        }
        self.watermark = operation.sequence_number;
        Some(operation)
    }
}

/// Gateway over a log, a snapshot store, and a pub/sub transport.
///
/// Every method takes `&self`. The session and room registry sits behind a
/// short-lived lock that is never held across an await or a log append, so
/// submits from different sessions reach the log concurrently and the log's
/// assignment step alone decides their order.
pub struct Gateway<L, S, P> {
    config: GatewayConfig,
    log: L,
    pubsub: P,
    bootstrapper: Bootstrapper<S, L>,
    ingress: OpIngress<L>,
    state: Mutex<GatewayState>,
    evictions: mpsc::UnboundedSender<Evicted>,
}

struct GatewayState {
    registry: RoomRegistry<RoomHandle>,
    evicted: mpsc::UnboundedReceiver<Evicted>,
}

/// What unregistering a session left to do outside the lock.
enum Released {
    /// The room has other members; detach the session from it.
    Detach(RoomClient),
    /// The session was the room's last member; stop the room.
    Close(RoomHandle),
}

impl GatewayState {
    /// Unregister a session and drop its room membership.
    fn release(&mut self, session_id: SessionId) -> Option<Released> {
        let entry = self.registry.unregister_session(session_id)?;
        let document_id = entry.document_id;

        if self.registry.remove_member(&document_id, session_id) == Some(0) {
            tracing::debug!(document_id = %document_id, "room released");
            return self.registry.remove_room(&document_id).map(Released::Close);
        }
        self.registry.room(&document_id).map(|room| Released::Detach(room.client().clone()))
    }

    /// Forget every session its room has evicted, returning rooms left with
    /// no members.
    fn reap(&mut self) -> Vec<RoomHandle> {
        let mut closed = Vec::new();
        while let Ok(Evicted { document_id, session_id }) = self.evicted.try_recv() {
            let registered = self
                .registry
                .session(session_id)
                .is_some_and(|entry| entry.document_id == document_id);
            if !registered {
                continue;
            }

            tracing::info!(document_id = %document_id, session_id, "reaping evicted session");
            // The room already dropped the session, so no detach is needed.
            if let Some(Released::Close(room)) = self.release(session_id) {
                closed.push(room);
            }
        }
        closed
    }
}

impl<L: DurableLog, S: SnapshotStore, P: PubSub> Gateway<L, S, P> {
    /// Create a gateway with no sessions.
    pub fn new(config: GatewayConfig, log: L, snapshots: S, pubsub: P) -> Self {
        let bootstrapper = Bootstrapper::new(snapshots, log.clone());
        let ingress = OpIngress::new(log.clone(), config.max_payload_size);
        let (evictions, evicted) = mpsc::unbounded_channel();
        Self {
            config,
            log,
            pubsub,
            bootstrapper,
            ingress,
            state: Mutex::new(GatewayState { registry: RoomRegistry::new(), evicted }),
            evictions,
        }
    }

    /// # Panics
    ///
    /// Panics if the state mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().expect("Mutex poisoned")
    }

    /// Join `session_id` to a document.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::SessionAlreadyJoined`] if the id is taken.
    /// - [`GatewayError::CapacityExceeded`] at `max_sessions`.
    /// - [`GatewayError::DocumentUnavailable`] if a collaborator fails.
    /// - [`GatewayError::OutOfOrderDelivery`] if the view has a gap.
    pub async fn join(
        &self,
        document_id: DocumentId,
        session_id: SessionId,
    ) -> Result<Joined, GatewayError> {
        self.reap_evicted().await;

        let room = self.admit(&document_id, session_id)?;

        match self.bootstrap_session(&document_id, session_id, &room).await {
            Ok(joined) => {
                self.state().registry.set_joined_at(session_id, joined.joined_at());
                tracing::info!(
                    document_id = %document_id,
                    session_id,
                    joined_at = joined.joined_at(),
                    deltas = joined.view.deltas.len(),
                    "session joined"
                );
                Ok(joined)
            },
            Err(e) => {
                tracing::warn!(document_id = %document_id, session_id, error = %e, "join failed");
                self.teardown(session_id).await;
                Err(e)
            },
        }
    }

    /// Register the session and make it a member of the document's room,
    /// creating the room if needed. Nothing is registered on error.
    fn admit(
        &self,
        document_id: &DocumentId,
        session_id: SessionId,
    ) -> Result<RoomClient, GatewayError> {
        let mut state = self.state();
        let registry = &mut state.registry;

        if registry.has_session(session_id) {
            return Err(GatewayError::SessionAlreadyJoined(session_id));
        }
        if registry.session_count() >= self.config.max_sessions {
            tracing::warn!(session_id, max = self.config.max_sessions, "session capacity reached");
            return Err(GatewayError::CapacityExceeded { max: self.config.max_sessions });
        }

        if !registry.has_room(document_id) {
            let handle = self.open_room(document_id)?;
            registry.insert_room(document_id.clone(), handle);
        }

        let room = registry.room(document_id).ok_or_else(|| room_closed(document_id))?.client().clone();
        registry.register_session(session_id, document_id.clone());
        registry.add_member(document_id, session_id);
        Ok(room)
    }

    async fn bootstrap_session(
        &self,
        document_id: &DocumentId,
        session_id: SessionId,
        room: &RoomClient,
    ) -> Result<Joined, GatewayError> {
        let (outbox, mut rx) = mpsc::channel(self.config.session_inbox_capacity.max(1));

        let attached_at =
            room.attach(session_id, outbox).await.map_err(|_| room_closed(document_id))?;

        let mut view = self.bootstrapper.bootstrap(document_id)?;

        // Everything the room delivered since attaching is queued in `rx`.
        // Fold the part the view doesn't cover into its deltas.
        let mut merged = 0;
        loop {
            match rx.try_recv() {
                Ok(operation) => {
                    let expected = view.last_sequence() + 1;
                    if operation.sequence_number < expected {
                        continue;
                    }
                    if operation.sequence_number > expected {
                        return Err(GatewayError::OutOfOrderDelivery {
                            document_id: document_id.clone(),
                            expected,
                            found: operation.sequence_number,
                        });
                    }
                    view.deltas.push(operation);
                    merged += 1;
                },
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(room_closed(document_id));
                },
            }
        }

        tracing::debug!(
            document_id = %document_id,
            session_id,
            attached_at,
            merged,
            "bootstrap window merged"
        );

        let watermark = view.last_sequence();
        Ok(Joined { session_id, view, stream: SessionStream { session_id, rx, watermark } })
    }

    /// Spawn a room for the document.
    ///
    /// The subscription is taken before the log position is read.
    fn open_room(&self, document_id: &DocumentId) -> Result<RoomHandle, GatewayError> {
        let subscription = self.pubsub.subscribe(document_id).map_err(|e| {
            GatewayError::DocumentUnavailable {
                document_id: document_id.clone(),
                reason: e.to_string(),
            }
        })?;

        let latest = self.log.latest_sequence(document_id).map_err(|e| {
            GatewayError::DocumentUnavailable {
                document_id: document_id.clone(),
                reason: e.to_string(),
            }
        })?;

        tracing::debug!(document_id = %document_id, latest_sequence = latest, "room created");

        Ok(RoomHandle::spawn(
            document_id.clone(),
            self.log.clone(),
            subscription,
            latest,
            self.config.room_inbox_capacity,
            self.evictions.clone(),
        ))
    }

    /// Submit an operation through a joined session.
    ///
    /// Only the session lookup takes the registry lock; the append runs
    /// without it.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::SessionNotFound`] for an unknown or evicted session.
    /// - [`GatewayError::DocumentMismatch`] if the session joined another
    ///   document.
    /// - [`GatewayError::InvalidOperation`] / [`GatewayError::LogUnavailable`]
    ///   from ingress.
    pub fn submit(
        &self,
        document_id: &DocumentId,
        session_id: SessionId,
        operation: Operation,
    ) -> Result<SubmissionAck, GatewayError> {
        let joined = {
            let mut state = self.state();
            // Rooms closed here stop once their handles drop.
            drop(state.reap());
            state.registry.session(session_id).map(|entry| entry.document_id.clone())
        };
        let joined = joined.ok_or(GatewayError::SessionNotFound(session_id))?;

        if joined != *document_id {
            return Err(GatewayError::DocumentMismatch {
                session_id,
                joined,
                requested: document_id.clone(),
            });
        }

        Ok(self.ingress.submit(document_id, operation)?)
    }

    /// Leave a session, tearing its room down if it was the last member.
    ///
    /// # Errors
    ///
    /// [`GatewayError::SessionNotFound`] if the session is unknown, already
    /// left, or was evicted.
    pub async fn leave(&self, session_id: SessionId) -> Result<(), GatewayError> {
        self.reap_evicted().await;
        if !self.teardown(session_id).await {
            return Err(GatewayError::SessionNotFound(session_id));
        }
        tracing::info!(session_id, "session left");
        Ok(())
    }

    /// Forget sessions their rooms evicted and stop rooms left empty.
    ///
    /// Joins and leaves do this first; call it directly to release an idle
    /// gateway's rooms. Returns the number of rooms stopped.
    pub async fn reap_evicted(&self) -> usize {
        let closed = self.state().reap();
        let count = closed.len();
        for room in closed {
            room.shutdown().await;
        }
        count
    }

    async fn teardown(&self, session_id: SessionId) -> bool {
        let released = self.state().release(session_id);
        match released {
            Some(Released::Detach(room)) => room.detach(session_id).await,
            Some(Released::Close(room)) => room.shutdown().await,
            None => return false,
        }
        true
    }

    /// Live rooms on this gateway.
    pub fn room_count(&self) -> usize {
        self.state().registry.room_count()
    }

    /// Joined sessions on this gateway, evicted ones excluded.
    pub fn session_count(&self) -> usize {
        let mut state = self.state();
        drop(state.reap());
        state.registry.session_count()
    }

    /// Bootstrap marker of a session.
    pub fn joined_at(&self, session_id: SessionId) -> Option<u64> {
        self.state().registry.session(session_id).and_then(|entry| entry.joined_at)
    }

    /// Gateway limits.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

fn room_closed(document_id: &DocumentId) -> GatewayError {
    GatewayError::DocumentUnavailable {
        document_id: document_id.clone(),
        reason: "room closed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChaoticLog, MemoryLog, MemoryPubSub, MemorySnapshotStore};

    fn doc(name: &str) -> DocumentId {
        DocumentId::new(name).unwrap()
    }

    fn gateway() -> Gateway<MemoryLog, MemorySnapshotStore, MemoryPubSub> {
        Gateway::new(
            GatewayConfig::default(),
            MemoryLog::new(),
            MemorySnapshotStore::new(),
            MemoryPubSub::new(),
        )
    }

    #[tokio::test]
    async fn duplicate_join_rejected() {
        let gateway = gateway();
        let _joined = gateway.join(doc("a"), 1).await.unwrap();

        let err = gateway.join(doc("a"), 1).await.unwrap_err();
        assert_eq!(err, GatewayError::SessionAlreadyJoined(1));
        assert_eq!(gateway.session_count(), 1);
    }

    #[tokio::test]
    async fn capacity_enforced() {
        let gateway = Gateway::new(
            GatewayConfig { max_sessions: 1, ..GatewayConfig::default() },
            MemoryLog::new(),
            MemorySnapshotStore::new(),
            MemoryPubSub::new(),
        );
        let _joined = gateway.join(doc("a"), 1).await.unwrap();

        let err = gateway.join(doc("a"), 2).await.unwrap_err();
        assert_eq!(err, GatewayError::CapacityExceeded { max: 1 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submits_from_many_tasks_share_the_gateway() {
        let log = MemoryLog::new();
        let gateway = std::sync::Arc::new(Gateway::new(
            GatewayConfig::default(),
            log.clone(),
            MemorySnapshotStore::new(),
            MemoryPubSub::new(),
        ));
        let mut joined = Vec::new();
        for session_id in 1..=4 {
            joined.push(gateway.join(doc("a"), session_id).await.unwrap());
        }

        let tasks: Vec<_> = (1..=4u64)
            .map(|session_id| {
                let gateway = std::sync::Arc::clone(&gateway);
                tokio::spawn(async move {
                    for client_seq in 1..=25 {
                        let operation = Operation::new(doc("a"), session_id, client_seq, Vec::new());
                        gateway.submit(&doc("a"), session_id, operation).unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        // Joins go through the same gateway while the submits run.
        let late = gateway.join(doc("a"), 5).await.unwrap();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(late.joined_at() <= 100);
        assert_eq!(gateway.session_count(), 5);
        let sequences: Vec<u64> =
            log.read_from(&doc("a"), 0).unwrap().iter().map(|op| op.sequence_number).collect();
        assert_eq!(sequences, (1..=100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failed_join_leaves_no_residue() {
        let gateway = Gateway::new(
            GatewayConfig::default(),
            ChaoticLog::new(MemoryLog::new(), 1.0),
            MemorySnapshotStore::new(),
            MemoryPubSub::new(),
        );

        let err = gateway.join(doc("a"), 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::DocumentUnavailable { .. }));
        assert_eq!(gateway.session_count(), 0);
        assert_eq!(gateway.room_count(), 0);
    }

    #[tokio::test]
    async fn submit_checks_session_document() {
        let gateway = gateway();
        let _joined = gateway.join(doc("a"), 1).await.unwrap();

        let op = Operation::new(doc("b"), 1, 0, Vec::new());
        assert_eq!(
            gateway.submit(&doc("b"), 1, op.clone()),
            Err(GatewayError::DocumentMismatch { session_id: 1, joined: doc("a"), requested: doc("b") })
        );
        assert_eq!(gateway.submit(&doc("b"), 2, op), Err(GatewayError::SessionNotFound(2)));
    }

    #[tokio::test]
    async fn last_leave_releases_room() {
        let gateway = gateway();
        let _first = gateway.join(doc("a"), 1).await.unwrap();
        let _second = gateway.join(doc("a"), 2).await.unwrap();
        assert_eq!(gateway.room_count(), 1);

        gateway.leave(1).await.unwrap();
        assert_eq!(gateway.room_count(), 1);

        gateway.leave(2).await.unwrap();
        assert_eq!(gateway.room_count(), 0);

        assert_eq!(gateway.leave(2).await, Err(GatewayError::SessionNotFound(2)));
    }

    #[test]
    fn stream_skips_covered_sequences() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = SessionStream { session_id: 1, rx, watermark: 2 };

        for seq in [1, 2, 3, 3, 4] {
            tx.try_send(SequencedOperation::new(seq, Operation::new(doc("a"), 1, seq, Vec::new())))
                .unwrap();
        }

        assert_eq!(stream.try_next().map(|op| op.sequence_number), Some(3));
        assert_eq!(stream.try_next().map(|op| op.sequence_number), Some(4));
        assert_eq!(stream.try_next(), None);
        assert_eq!(stream.watermark(), 4);
    }

    #[tokio::test]
    async fn evicted_session_is_reaped() {
        let log = MemoryLog::new();
        let pubsub = MemoryPubSub::new();
        let gateway = Gateway::new(
            GatewayConfig { max_sessions: 1, session_inbox_capacity: 1, ..GatewayConfig::default() },
            log.clone(),
            MemorySnapshotStore::new(),
            pubsub.clone(),
        );
        let mut joined = gateway.join(doc("a"), 1).await.unwrap();

        for seq in 1..=3 {
            let op = Operation::new(doc("a"), 1, seq, Vec::new());
            pubsub.publish(&doc("a"), SequencedOperation::new(seq, op)).unwrap();
        }
        while joined.stream.next().await.is_some() {}

        assert_eq!(gateway.session_count(), 0);
        assert_eq!(
            gateway.submit(&doc("a"), 1, Operation::new(doc("a"), 1, 4, Vec::new())),
            Err(GatewayError::SessionNotFound(1))
        );
        assert_eq!(gateway.room_count(), 0, "last member evicted, room released");

        // The evicted slot no longer counts against capacity.
        let _rejoined = gateway.join(doc("a"), 2).await.unwrap();
        assert_eq!(gateway.leave(1).await, Err(GatewayError::SessionNotFound(1)));
    }

    #[tokio::test]
    async fn dropped_stream_frees_session() {
        let log = MemoryLog::new();
        let pubsub = MemoryPubSub::new();
        tokio::spawn(
            crate::FanoutBroadcaster::new(log.clone(), pubsub.clone()).run(log.subscribe_output()),
        );
        let gateway = Gateway::new(GatewayConfig::default(), log, MemorySnapshotStore::new(), pubsub);

        let dropped = gateway.join(doc("a"), 1).await.unwrap();
        let mut kept = gateway.join(doc("a"), 2).await.unwrap();
        drop(dropped.stream);

        gateway.submit(&doc("a"), 2, Operation::new(doc("a"), 2, 1, Vec::new())).unwrap();
        assert_eq!(kept.stream.next().await.map(|op| op.sequence_number), Some(1));

        assert_eq!(gateway.session_count(), 1);
        assert_eq!(gateway.room_count(), 1);
    }
}
