//! Document rooms.
//!
//! A room is a task owning one document's pub/sub subscription and the
//! outboxes of the local sessions joined to it. It feeds every received
//! operation through a [`DeliveryBuffer`] so sessions see the document's
//! stream gap-free, in sequence order, and without redeliveries.
//!
//! The gateway talks to the room through a bounded command inbox. A room
//! stops when its inbox closes (the gateway dropped the handle) or when its
//! subscription closes; either way, dropping the outboxes ends every member
//! session's stream. Sessions the room drops on its own (full inbox, stream
//! gone) are reported back as [`Evicted`] notices so the gateway can forget
//! them.

use std::collections::HashMap;

use mergeline_core::{Admission, DeliveryBuffer, DeliveryError};
use mergeline_proto::{DocumentId, SequencedOperation, SessionId};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::storage::{DurableLog, Subscription, SubscriptionError};

/// Room task is gone.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("room closed")]
pub struct RoomClosed;

/// Commands accepted by a room task.
#[derive(Debug)]
pub enum RoomCommand {
    /// Start delivering to a session.
    Attach {
        /// Session to attach
        session_id: SessionId,
        /// Where the session's operations go
        outbox: mpsc::Sender<SequencedOperation>,
        /// Answered with the room's last delivered sequence number once the
        /// session is attached. Everything above it reaches the outbox.
        ack: oneshot::Sender<u64>,
    },
    /// Stop delivering to a session.
    Detach {
        /// Session to detach
        session_id: SessionId,
    },
}

/// A session the room stopped delivering to without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    /// Room's document
    pub document_id: DocumentId,
    /// Dropped session
    pub session_id: SessionId,
}

/// Cloneable command sender for a running room.
#[derive(Debug, Clone)]
pub struct RoomClient {
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomClient {
    /// Attach a session and wait until the room has it.
    ///
    /// Returns the room's last delivered sequence number at attach time.
    pub async fn attach(
        &self,
        session_id: SessionId,
        outbox: mpsc::Sender<SequencedOperation>,
    ) -> Result<u64, RoomClosed> {
        let (ack, attached) = oneshot::channel();
        self.tx
            .send(RoomCommand::Attach { session_id, outbox, ack })
            .await
            .map_err(|_| RoomClosed)?;
        attached.await.map_err(|_| RoomClosed)
    }

    /// Detach a session. A closed room has no sessions, so that is not an
    /// error.
    pub async fn detach(&self, session_id: SessionId) {
        let _ = self.tx.send(RoomCommand::Detach { session_id }).await;
    }
}

/// Gateway-side handle to a running room.
///
/// Dropping the handle closes the room's inbox, which stops the task.
#[derive(Debug)]
pub struct RoomHandle {
    client: RoomClient,
    task: JoinHandle<()>,
}

impl RoomHandle {
    /// Spawn a room task.
    ///
    /// `subscription` must already be active and `last_delivered` read from
    /// the log after it was taken: operations at or below it are covered by
    /// bootstrap views, everything above arrives on the subscription.
    pub fn spawn<L: DurableLog>(
        document_id: DocumentId,
        log: L,
        subscription: Subscription,
        last_delivered: u64,
        inbox_capacity: usize,
        evictions: mpsc::UnboundedSender<Evicted>,
    ) -> Self {
        let (tx, commands) = mpsc::channel(inbox_capacity.max(1));

        let room = Room {
            document_id,
            log,
            subscription,
            buffer: DeliveryBuffer::after(last_delivered),
            sessions: HashMap::new(),
            commands,
            evictions,
        };

        let task = tokio::spawn(room.run());
        Self { client: RoomClient { tx }, task }
    }

    /// Command sender for this room.
    pub fn client(&self) -> &RoomClient {
        &self.client
    }

    /// Close the inbox and wait for the task to finish, releasing the
    /// subscription.
    pub async fn shutdown(self) {
        drop(self.client);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "room task failed");
        }
    }

    /// Whether the room task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Room<L> {
    document_id: DocumentId,
    log: L,
    subscription: Subscription,
    buffer: DeliveryBuffer,
    sessions: HashMap<SessionId, mpsc::Sender<SequencedOperation>>,
    commands: mpsc::Receiver<RoomCommand>,
    evictions: mpsc::UnboundedSender<Evicted>,
}

impl<L: DurableLog> Room<L> {
    async fn run(mut self) {
        tracing::debug!(
            document_id = %self.document_id,
            last_delivered = self.buffer.last_delivered(),
            "room started"
        );

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                received = self.subscription.recv() => match received {
                    Ok(operation) => self.admit(operation),
                    Err(SubscriptionError::Lagged(skipped)) => {
                        tracing::warn!(
                            document_id = %self.document_id,
                            skipped,
                            "room subscription lagged"
                        );
                        self.backfill();
                    },
                    Err(SubscriptionError::Closed) => {
                        tracing::warn!(document_id = %self.document_id, "room subscription closed");
                        break;
                    },
                },
            }
        }

        tracing::debug!(
            document_id = %self.document_id,
            sessions = self.sessions.len(),
            "room stopped"
        );
    }

    fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Attach { session_id, outbox, ack } => {
                self.sessions.insert(session_id, outbox);
                if ack.send(self.buffer.last_delivered()).is_err() {
                    // Joiner gave up before the attach completed.
                    self.sessions.remove(&session_id);
                }
            },
            RoomCommand::Detach { session_id } => {
                self.sessions.remove(&session_id);
            },
        }
    }

    fn admit(&mut self, operation: SequencedOperation) {
        if operation.document_id() != &self.document_id {
            tracing::warn!(
                document_id = %self.document_id,
                received = %operation.document_id(),
                "operation for another document on room channel"
            );
            return;
        }

        match self.buffer.accept(operation) {
            Ok(Admission::Ready(ready)) => {
                for operation in ready {
                    self.deliver(&operation);
                }
            },
            Ok(Admission::Duplicate) => {},
            Ok(Admission::Held { expected, received }) => {
                tracing::warn!(
                    document_id = %self.document_id,
                    expected,
                    received,
                    "out-of-order delivery, holding"
                );
                self.backfill();
            },
            Err(DeliveryError::HoldLimitExceeded { expected, held, max }) => {
                tracing::warn!(
                    document_id = %self.document_id,
                    expected,
                    held,
                    max,
                    "out-of-order delivery, hold limit reached"
                );
                self.backfill();
            },
        }
    }

    /// Fill a gap from the log.
    fn backfill(&mut self) {
        let since = self.buffer.last_delivered();
        let backlog = match self.log.read_from(&self.document_id, since) {
            Ok(backlog) => backlog,
            Err(e) => {
                tracing::warn!(document_id = %self.document_id, since, error = %e, "backfill failed");
                return;
            },
        };

        for operation in backlog {
            match self.buffer.accept(operation) {
                Ok(Admission::Ready(ready)) => {
                    for operation in ready {
                        self.deliver(&operation);
                    }
                },
                Ok(Admission::Duplicate | Admission::Held { .. }) => {},
                Err(e) => {
                    tracing::warn!(document_id = %self.document_id, error = %e, "backfill stalled");
                    return;
                },
            }
        }
    }

    fn deliver(&mut self, operation: &SequencedOperation) {
        let document_id = &self.document_id;
        let evictions = &self.evictions;
        self.sessions.retain(|&session_id, outbox| {
            match outbox.try_send(operation.clone()) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        document_id = %document_id,
                        session_id,
                        sequence_number = operation.sequence_number,
                        "session inbox full, evicting"
                    );
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(document_id = %document_id, session_id, "session stream dropped");
                },
            }
            // Queued before the outbox drops, so the gateway can reap the
            // session by the time its stream ends.
            let _ = evictions.send(Evicted { document_id: document_id.clone(), session_id });
            false
        });
    }
}
