//! Op ingress sequencer.
//!
//! Validates a submitted operation and hands it to the durable log, which
//! assigns the authoritative sequence number. The acknowledgement only means
//! the log accepted the entry for ordering; the submitter sees its position
//! when the sequenced operation comes back on its own stream.

use mergeline_proto::{DocumentId, Operation, SubmissionAck};
use thiserror::Error;

use crate::storage::{DurableLog, LogError};

/// Ingress failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngressError {
    /// Operation rejected before reaching the log.
    #[error("invalid operation for document {document_id}: {reason}")]
    InvalidOperation {
        /// Target document
        document_id: DocumentId,
        /// What was wrong
        reason: String,
    },

    /// Log refused the handoff. Not retried here; the caller may resubmit.
    #[error("log unavailable for document {document_id}: {source}")]
    LogUnavailable {
        /// Target document
        document_id: DocumentId,
        /// Log error, verbatim
        source: LogError,
    },
}

/// Hands operations to the durable log.
#[derive(Clone)]
pub struct OpIngress<L> {
    log: L,
    max_payload_size: usize,
}

impl<L: DurableLog> OpIngress<L> {
    /// Ingress over `log`, rejecting payloads above `max_payload_size` bytes.
    pub fn new(log: L, max_payload_size: usize) -> Self {
        Self { log, max_payload_size }
    }

    /// Submit an operation for ordering.
    ///
    /// # Errors
    ///
    /// - [`IngressError::InvalidOperation`] if the operation names a different
    ///   document or its payload is too large.
    /// - [`IngressError::LogUnavailable`] if the append fails.
    pub fn submit(
        &self,
        document_id: &DocumentId,
        operation: Operation,
    ) -> Result<SubmissionAck, IngressError> {
        if operation.document_id != *document_id {
            return Err(IngressError::InvalidOperation {
                document_id: document_id.clone(),
                reason: format!("operation targets document {}", operation.document_id),
            });
        }

        if operation.payload.len() > self.max_payload_size {
            return Err(IngressError::InvalidOperation {
                document_id: document_id.clone(),
                reason: format!(
                    "payload of {} bytes exceeds {}",
                    operation.payload.len(),
                    self.max_payload_size
                ),
            });
        }

        let ack = SubmissionAck::from(&operation);

        self.log.append(document_id, operation).map_err(|source| {
            tracing::warn!(document_id = %document_id, error = %source, "log append failed");
            IngressError::LogUnavailable { document_id: document_id.clone(), source }
        })?;

        tracing::trace!(
            document_id = %document_id,
            client_id = ack.client_id,
            client_seq = ack.client_seq,
            "operation handed to log"
        );

        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChaoticLog, MemoryLog};

    fn doc(name: &str) -> DocumentId {
        DocumentId::new(name).unwrap()
    }

    #[test]
    fn ack_echoes_operation() {
        let log = MemoryLog::new();
        let ingress = OpIngress::new(log.clone(), 1024);

        let ack = ingress.submit(&doc("doc-1"), Operation::new(doc("doc-1"), 7, 3, b"x".to_vec())).unwrap();
        assert_eq!(ack.client_id, 7);
        assert_eq!(ack.client_seq, 3);
        assert_eq!(log.latest_sequence(&doc("doc-1")).unwrap(), 1);
    }

    #[test]
    fn rejects_foreign_document() {
        let log = MemoryLog::new();
        let ingress = OpIngress::new(log.clone(), 1024);

        let err = ingress.submit(&doc("doc-1"), Operation::new(doc("doc-2"), 1, 0, Vec::new()));
        assert!(matches!(err, Err(IngressError::InvalidOperation { .. })));
        assert_eq!(log.total_entries(), 0);
    }

    #[test]
    fn rejects_oversized_payload() {
        let ingress = OpIngress::new(MemoryLog::new(), 4);
        let err = ingress
            .submit(&doc("doc-1"), Operation::new(doc("doc-1"), 1, 0, vec![0u8; 5]))
            .unwrap_err();
        assert!(err.to_string().contains("exceeds 4"));
    }

    #[test]
    fn log_failure_is_surfaced() {
        let ingress = OpIngress::new(ChaoticLog::new(MemoryLog::new(), 1.0), 1024);
        let err = ingress
            .submit(&doc("doc-1"), Operation::new(doc("doc-1"), 1, 0, Vec::new()))
            .unwrap_err();
        assert_eq!(
            err,
            IngressError::LogUnavailable {
                document_id: doc("doc-1"),
                source: LogError::Unavailable("chaotic failure injection".to_string()),
            }
        );
    }
}
