//! Frame header with zero-copy parsing.
//!
//! The `FrameHeader` is a fixed 16-byte big-endian structure. Gateways read
//! it first to learn the frame kind and how many body bytes follow, so a
//! stream reader can bound its next read before any CBOR is touched.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// What the frame body contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Client request (`Join`, `Submit`, `Leave`)
    Request = 0x01,
    /// Gateway response to a request
    Response = 0x02,
    /// Gateway-initiated delivery of a sequenced operation
    Push = 0x03,
}

impl FrameKind {
    /// Decode a kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::Push),
            _ => None,
        }
    }

    /// Encode as the wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Fixed 16-byte frame header (big endian).
///
/// Fields are raw byte arrays so every 16-byte pattern is a valid value and
/// the struct can be cast straight from untrusted network bytes; semantic
/// validation happens in [`FrameHeader::from_bytes`].
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    magic: [u8; 4],      // 0x4D474C4E ("MGLN")
    version: u8,         // 0x01
    kind: u8,            // FrameKind
    reserved: [u8; 2],   // must be zero on send, ignored on receive
    request_id: [u8; 4], // client nonce echoed in the response
    pub(crate) payload_size: [u8; 4],
}

impl FrameHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 16;

    /// Magic number: "MGLN" in ASCII.
    pub const MAGIC: u32 = 0x4D47_4C4E;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum body size (16 MiB).
    pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

    /// Create a header of the given kind with an empty body.
    #[must_use]
    pub fn new(kind: FrameKind) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            kind: kind.to_u8(),
            reserved: [0; 2],
            request_id: [0; 4],
            payload_size: [0; 4],
        }
    }

    /// Parse a header from the front of `bytes` without copying.
    ///
    /// Checks, cheapest first: length, magic, version, kind, payload bound.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let (header, _) = Self::ref_from_prefix(bytes).map_err(|_| {
            ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() }
        })?;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        if FrameKind::from_u8(header.kind).is_none() {
            return Err(ProtocolError::UnknownKind(header.kind));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Magic number.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Frame kind. `None` only for headers that bypassed [`Self::from_bytes`].
    #[must_use]
    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_u8(self.kind)
    }

    /// Request identifier.
    #[must_use]
    pub fn request_id(&self) -> u32 {
        u32::from_be_bytes(self.request_id)
    }

    /// Body length in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Set the request identifier.
    pub fn set_request_id(&mut self, request_id: u32) {
        self.request_id = request_id.to_be_bytes();
    }
}

impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("kind", &self.kind())
            .field("request_id", &self.request_id())
            .field("payload_size", &self.payload_size())
            .finish()
    }
}
