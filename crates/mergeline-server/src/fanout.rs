//! Fanout broadcaster.
//!
//! Consumes the durable log's output stream and republishes every sequenced
//! operation to its document's pub/sub channel. Publication is idempotent
//! per sequence number: redelivered log output is dropped, and a skipped
//! range (the consumer lagged) is backfilled from the log before the newer
//! entry goes out, so every channel sees its document's numbers in order.
//!
//! One broadcaster runs per process. Gateways on any instance subscribe to
//! the pub/sub channels, never to the log output directly.

use std::collections::HashMap;

use mergeline_proto::{DocumentId, SequencedOperation};
use thiserror::Error;

use crate::storage::{DurableLog, LogError, PubSub, Subscription, SubscriptionError, TransportError};

/// Fanout failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FanoutError {
    /// Gap backfill could not read the log.
    #[error("backfill for document {document_id} failed: {source}")]
    Backfill {
        /// Document with the gap
        document_id: DocumentId,
        /// Log error, verbatim
        source: LogError,
    },

    /// Publishing to the document channel failed.
    #[error("publish of sequence {sequence_number} for document {document_id} failed: {source}")]
    Publish {
        /// Target document
        document_id: DocumentId,
        /// Entry that was not published
        sequence_number: u64,
        /// Transport error, verbatim
        source: TransportError,
    },

    /// Listing the subscribed documents failed.
    #[error("listing subscribed documents failed: {source}")]
    Channels {
        /// Transport error, verbatim
        source: TransportError,
    },
}

/// Result of handling one log output entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// Entries were published (more than one when a gap was backfilled).
    Published {
        /// Entries published
        operations: usize,
        /// Subscriber deliveries across those entries
        reached: usize,
    },
    /// Already published; dropped.
    Duplicate,
}

/// Republishes log output to per-document pub/sub channels.
pub struct FanoutBroadcaster<L, P> {
    log: L,
    pubsub: P,
    /// Highest sequence number published per document
    last_published: HashMap<DocumentId, u64>,
}

impl<L: DurableLog, P: PubSub> FanoutBroadcaster<L, P> {
    /// Create a broadcaster with no publication history.
    pub fn new(log: L, pubsub: P) -> Self {
        Self { log, pubsub, last_published: HashMap::new() }
    }

    /// Highest sequence number published for `document_id`, if any.
    pub fn last_published(&self, document_id: &DocumentId) -> Option<u64> {
        self.last_published.get(document_id).copied()
    }

    /// Handle one entry from the log output.
    ///
    /// The first entry seen for a document establishes the baseline; entries
    /// before it were published by an earlier broadcaster or had no
    /// audience.
    ///
    /// # Errors
    ///
    /// On error nothing past the last successful publish is recorded, so a
    /// redelivery of the same entry is published again.
    pub fn handle(&mut self, operation: SequencedOperation) -> Result<FanoutOutcome, FanoutError> {
        let document_id = operation.document_id().clone();
        let sequence_number = operation.sequence_number;

        let last = *self
            .last_published
            .entry(document_id.clone())
            .or_insert_with(|| sequence_number.saturating_sub(1));

        if sequence_number <= last {
            tracing::trace!(document_id = %document_id, sequence_number, "duplicate log output");
            return Ok(FanoutOutcome::Duplicate);
        }

        if sequence_number == last + 1 {
            let reached = self.publish(&document_id, operation)?;
            return Ok(FanoutOutcome::Published { operations: 1, reached });
        }

        tracing::warn!(
            document_id = %document_id,
            expected = last + 1,
            found = sequence_number,
            "log output skipped sequence numbers, backfilling"
        );

        let backlog = self
            .log
            .read_from(&document_id, last)
            .map_err(|source| FanoutError::Backfill { document_id: document_id.clone(), source })?;

        let mut outcome = (0, 0);
        for entry in backlog.into_iter().take_while(|e| e.sequence_number <= sequence_number) {
            outcome.1 += self.publish(&document_id, entry)?;
            outcome.0 += 1;
        }

        // The log should always hold the entry it just emitted.
        if self.last_published(&document_id) < Some(sequence_number) {
            outcome.1 += self.publish(&document_id, operation)?;
            outcome.0 += 1;
        }

        Ok(FanoutOutcome::Published { operations: outcome.0, reached: outcome.1 })
    }

    /// Publish everything the log holds past the last published entry of
    /// every known document and every document with live subscribers.
    ///
    /// Used after the output stream lagged, when the skipped entries may have
    /// been the newest ones and no later entry would reveal the gap. A
    /// subscribed document the broadcaster has never seen is replayed from
    /// sequence 1; subscribers drop what they already hold.
    pub fn catch_up(&mut self) -> Result<usize, FanoutError> {
        let mut documents: HashMap<DocumentId, u64> = self.last_published.clone();
        for document_id in
            self.pubsub.active_documents().map_err(|source| FanoutError::Channels { source })?
        {
            documents.entry(document_id).or_insert(0);
        }

        let mut published = 0;
        for (document_id, last) in documents {
            let backlog = self.log.read_from(&document_id, last).map_err(|source| {
                FanoutError::Backfill { document_id: document_id.clone(), source }
            })?;
            for entry in backlog {
                self.publish(&document_id, entry)?;
                published += 1;
            }
        }

        Ok(published)
    }

    /// Consume the log output until it closes.
    pub async fn run(mut self, mut output: Subscription) {
        tracing::info!("fanout broadcaster started");

        loop {
            match output.recv().await {
                Ok(operation) => {
                    if let Err(e) = self.handle(operation) {
                        tracing::error!(error = %e, "fanout failed");
                    }
                },
                Err(SubscriptionError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "fanout lagged behind log output");
                    match self.catch_up() {
                        Ok(published) => tracing::info!(published, "fanout caught up"),
                        Err(e) => tracing::error!(error = %e, "fanout catch-up failed"),
                    }
                },
                Err(SubscriptionError::Closed) => {
                    tracing::info!("log output closed, fanout stopping");
                    return;
                },
            }
        }
    }

    fn publish(
        &mut self,
        document_id: &DocumentId,
        operation: SequencedOperation,
    ) -> Result<usize, FanoutError> {
        let sequence_number = operation.sequence_number;

        let reached = self.pubsub.publish(document_id, operation).map_err(|source| {
            FanoutError::Publish { document_id: document_id.clone(), sequence_number, source }
        })?;

        self.last_published.insert(document_id.clone(), sequence_number);

        tracing::trace!(document_id = %document_id, sequence_number, reached, "published");
        Ok(reached)
    }
}
