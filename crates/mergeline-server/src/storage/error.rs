//! Collaborator error types.
//!
//! - `StorageError`: snapshot store failures. `NotFound` is benign.
//! - `LogError`: durable log failures.
//! - `TransportError`: pub/sub publish/subscribe failures.
//! - `SubscriptionError`: conditions observed while reading a stream.

use thiserror::Error;

/// Errors from the snapshot store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No snapshot exists for the document (it has never been compacted).
    #[error("no snapshot for document {0}")]
    NotFound(String),

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors from the durable ordered log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Log cannot accept or return entries right now.
    #[error("log unavailable: {0}")]
    Unavailable(String),

    /// Persisted log disagrees with the cached next sequence number.
    ///
    /// The sequencer cache is cleared; the caller may resubmit.
    #[error("sequence conflict for document {document_id}: expected {expected}, found {found}")]
    Conflict {
        /// Document whose log drifted
        document_id: String,
        /// Sequence number the cache would have assigned
        expected: u64,
        /// Sequence number already present
        found: u64,
    },

    /// Sequence numbers exhausted.
    #[error("sequence number overflow for document {0}")]
    Overflow(String),

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from the pub/sub transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport refused the publish or subscribe.
    #[error("pub/sub unavailable: {0}")]
    Unavailable(String),
}

/// Conditions observed while receiving from a stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Receiver fell behind; this many messages were skipped.
    #[error("subscriber lagged by {0} messages")]
    Lagged(u64),

    /// Publisher side is gone.
    #[error("subscription closed")]
    Closed,
}
