//! Mergeline wire protocol.
//!
//! Shared types for the operation relay: document and session identifiers,
//! operations before and after sequencing, snapshots, bootstrap views, and
//! the framed CBOR messages exchanged between clients and gateway instances.
//!
//! # Framing
//!
//! Every message is a [`Frame`]: a fixed 16-byte big-endian [`FrameHeader`]
//! followed by a CBOR body. The header carries enough to route and bound the
//! read (kind, request id, payload size) without touching the body.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod errors;
mod frame;
mod header;
mod ids;
pub mod message;
mod operation;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::{FrameHeader, FrameKind};
pub use ids::{ClientId, DocumentId, SessionId};
pub use message::{ErrorBody, Message, Push, Request, Response, ResponseData, status};
pub use operation::{BootstrapView, Operation, SequencedOperation, Snapshot, SubmissionAck};

/// ALPN protocol identifier negotiated on QUIC connections.
pub const ALPN_PROTOCOL: &[u8] = b"mergeline/1";
