//! Identifiers for documents, sessions and clients.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Gateway-local session identifier.
pub type SessionId = u64;

/// Identifier of the client (replica) that authored an operation.
pub type ClientId = u64;

/// Identifier of one collaborative document.
///
/// Also the partition key of the durable log and the channel name on the
/// pub/sub transport. Non-empty and at most [`DocumentId::MAX_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    /// Longest accepted identifier, in bytes.
    pub const MAX_LEN: usize = 256;

    /// Validate and wrap a document identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ProtocolError::InvalidDocumentId("empty".to_string()));
        }
        if id.len() > Self::MAX_LEN {
            return Err(ProtocolError::InvalidDocumentId(format!(
                "{} bytes exceeds {}",
                id.len(),
                Self::MAX_LEN
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ProtocolError::InvalidDocumentId(
                "contains control characters".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier bytes, used as storage key prefix.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for DocumentId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for DocumentId {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
