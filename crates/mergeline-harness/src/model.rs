//! Plain-text document model used by simulated replicas.
//!
//! The relay never looks inside payloads; this model gives them meaning on
//! the replica side so convergence can be checked on rendered text. Edits are
//! CBOR-encoded [`TextEdit`] values. Positions count characters and are
//! clamped to the document, so every edit applies to every state and the
//! result depends only on the order edits are applied in.

use std::fmt;

use mergeline_core::DocumentModel;
use mergeline_proto::Operation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Text model errors.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Snapshot state is not UTF-8.
    #[error("snapshot state is not valid UTF-8")]
    InvalidState,

    /// Payload is not a CBOR-encoded edit.
    #[error("undecodable edit: {0}")]
    Decode(String),

    /// Edit could not be encoded.
    #[error("unencodable edit: {0}")]
    Encode(String),
}

/// One edit to a text document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEdit {
    /// Insert `text` before character `pos`.
    Insert {
        /// Character offset, clamped to the document length
        pos: usize,
        /// Inserted text
        text: String,
    },
    /// Remove up to `len` characters starting at `pos`.
    Delete {
        /// Character offset, clamped to the document length
        pos: usize,
        /// Characters to remove
        len: usize,
    },
}

impl TextEdit {
    /// Insert edit.
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::Insert { pos, text: text.into() }
    }

    /// Delete edit.
    pub fn delete(pos: usize, len: usize) -> Self {
        Self::Delete { pos, len }
    }

    /// Encode as an operation payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, ModelError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).map_err(|e| ModelError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode an operation payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ModelError> {
        ciborium::de::from_reader(payload).map_err(|e| ModelError::Decode(e.to_string()))
    }
}

/// Human-readable descriptor, as recorded in the convergence ledger.
impl fmt::Display for TextEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert { pos, text } => write!(f, "insert {text} at {pos}"),
            Self::Delete { pos, len } => write!(f, "delete {len} at {pos}"),
        }
    }
}

/// Plain-text document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextDocument {
    text: String,
}

impl TextDocument {
    /// Current text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Serialized state for the snapshot store.
    pub fn to_state(&self) -> Vec<u8> {
        self.text.as_bytes().to_vec()
    }

    /// Apply an edit directly.
    pub fn apply_edit(&mut self, edit: &TextEdit) {
        match edit {
            TextEdit::Insert { pos, text } => {
                let at = self.byte_offset(*pos);
                self.text.insert_str(at, text);
            },
            TextEdit::Delete { pos, len } => {
                let start = self.byte_offset(*pos);
                let end = self.byte_offset(pos.saturating_add(*len));
                self.text.replace_range(start..end, "");
            },
        }
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.text.char_indices().nth(chars).map_or(self.text.len(), |(i, _)| i)
    }
}

impl DocumentModel for TextDocument {
    type Error = ModelError;

    fn restore(state: &[u8]) -> Result<Self, ModelError> {
        let text = std::str::from_utf8(state).map_err(|_| ModelError::InvalidState)?;
        Ok(Self { text: text.to_string() })
    }

    fn apply(&mut self, op: &Operation) -> Result<(), ModelError> {
        let edit = TextEdit::from_payload(&op.payload)?;
        self.apply_edit(&edit);
        Ok(())
    }

    fn render(&self) -> String {
        self.text.clone()
    }
}
