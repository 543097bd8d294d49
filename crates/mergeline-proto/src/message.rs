//! CBOR-encoded request, response and push bodies.
//!
//! The frame header's kind names which of the three body types follows, so
//! the body itself carries no outer tag. Responses mirror an HTTP-ish shape:
//! a `mime_type` content tag, a numeric `status`, optional `data`, and an
//! `error` body when the request failed.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    BootstrapView, DocumentId, Frame, FrameHeader, FrameKind, Operation, SequencedOperation,
    SessionId, SubmissionAck,
    errors::{ProtocolError, Result},
};

/// Numeric response statuses.
pub mod status {
    /// Request succeeded.
    pub const OK: u16 = 200;
    /// Request was malformed or the operation failed validation.
    pub const BAD_REQUEST: u16 = 400;
    /// Session does not exist on this gateway.
    pub const NOT_FOUND: u16 = 404;
    /// Session id already joined.
    pub const CONFLICT: u16 = 409;
    /// Gateway is at session capacity.
    pub const TOO_MANY_REQUESTS: u16 = 429;
    /// A collaborator (snapshot store, durable log) is unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Content tags carried in [`Response::mime_type`].
pub mod mime {
    /// Body is a join result with its bootstrap view.
    pub const BOOTSTRAP: &str = "application/vnd.mergeline.bootstrap+cbor";
    /// Body is a submission acknowledgement.
    pub const ACK: &str = "application/vnd.mergeline.ack+cbor";
    /// Body confirms a leave.
    pub const LEFT: &str = "application/vnd.mergeline.left+cbor";
    /// Body is an error description only.
    pub const ERROR: &str = "application/vnd.mergeline.error+cbor";
}

/// Client requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Join a document; the gateway allocates the session id.
    Join {
        /// Document to join
        document_id: DocumentId,
    },
    /// Submit an operation through a joined session.
    Submit {
        /// Session the operation is submitted through
        session_id: SessionId,
        /// The operation
        operation: Operation,
    },
    /// Leave a session.
    Leave {
        /// Session to close
        session_id: SessionId,
    },
}

/// Successful response payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseData {
    /// Join completed.
    Joined {
        /// Session allocated for the join
        session_id: SessionId,
        /// Snapshot plus trailing operations
        view: BootstrapView,
    },
    /// Operation accepted for ordering.
    Submitted(SubmissionAck),
    /// Session closed.
    Left {
        /// Session that was closed
        session_id: SessionId,
    },
}

/// Error body attached to failed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code
    pub code: u16,
    /// Human-readable description with document/session context
    pub message: String,
}

impl ErrorBody {
    /// Snapshot store failed while bootstrapping.
    pub const DOCUMENT_UNAVAILABLE: u16 = 0x0001;
    /// Durable log refused or failed the request.
    pub const LOG_UNAVAILABLE: u16 = 0x0002;
    /// Session unknown to this gateway.
    pub const SESSION_NOT_FOUND: u16 = 0x0003;
    /// Session id already joined.
    pub const SESSION_ALREADY_JOINED: u16 = 0x0004;
    /// Operation targets a different document than the session.
    pub const DOCUMENT_MISMATCH: u16 = 0x0005;
    /// Operation failed validation.
    pub const INVALID_OPERATION: u16 = 0x0006;
    /// Sequence gap observed while assembling a view.
    pub const OUT_OF_ORDER: u16 = 0x0007;
    /// Gateway at session capacity.
    pub const CAPACITY_EXCEEDED: u16 = 0x0008;
    /// Request body could not be decoded.
    pub const INVALID_REQUEST: u16 = 0x0009;

    /// Create an error body.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Content tag describing `data` (or the error)
    pub mime_type: String,
    /// HTTP-like status code
    pub status: u16,
    /// Payload on success
    pub data: Option<ResponseData>,
    /// Error description on failure
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Successful response; the content tag follows the data variant.
    pub fn ok(data: ResponseData) -> Self {
        let mime_type = match &data {
            ResponseData::Joined { .. } => mime::BOOTSTRAP,
            ResponseData::Submitted(_) => mime::ACK,
            ResponseData::Left { .. } => mime::LEFT,
        };
        Self { mime_type: mime_type.to_string(), status: status::OK, data: Some(data), error: None }
    }

    /// Failed response.
    pub fn error(status: u16, error: ErrorBody) -> Self {
        Self { mime_type: mime::ERROR.to_string(), status, data: None, error: Some(error) }
    }

    /// Whether the status signals success.
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

/// A sequenced operation delivered to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    /// Receiving session
    pub session_id: SessionId,
    /// The delivered operation
    pub operation: SequencedOperation,
}

/// Any decoded frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client request
    Request(Request),
    /// Gateway response
    Response(Response),
    /// Gateway push
    Push(Push),
}

impl Message {
    /// Frame kind this body travels under.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Request(_) => FrameKind::Request,
            Self::Response(_) => FrameKind::Response,
            Self::Push(_) => FrameKind::Push,
        }
    }

    /// Encode into a frame, stamping `request_id` into the header.
    pub fn into_frame(self, request_id: u32) -> Result<Frame> {
        let mut header = FrameHeader::new(self.kind());
        header.set_request_id(request_id);

        let body = match &self {
            Self::Request(r) => to_cbor(r)?,
            Self::Response(r) => to_cbor(r)?,
            Self::Push(p) => to_cbor(p)?,
        };

        if body.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: body.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(Frame::new(header, Bytes::from(body)))
    }

    /// Decode a frame body according to its header kind.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let kind = frame.header.kind().ok_or(ProtocolError::UnknownKind(0))?;
        let body = frame.payload.as_ref();
        match kind {
            FrameKind::Request => from_cbor(body).map(Self::Request),
            FrameKind::Response => from_cbor(body).map(Self::Response),
            FrameKind::Push => from_cbor(body).map(Self::Push),
        }
    }
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
