//! Protocol errors.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing, parsing, or validating wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer shorter than a frame header.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum length required
        expected: usize,
        /// Length supplied
        actual: usize,
    },

    /// Header magic does not match `MGLN`.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Header version is not supported by this build.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Header names a frame kind we do not know.
    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    /// Payload exceeds the protocol limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Claimed or actual size
        size: usize,
        /// Maximum permitted
        max: usize,
    },

    /// Fewer payload bytes than the header claims.
    #[error("frame truncated: expected {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload size from the header
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// CBOR encoding failed.
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR decoding failed.
    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    /// Document identifier failed validation.
    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),
}
