//! Frame: header plus opaque body bytes.

use bytes::{BufMut, Bytes};

use crate::{
    errors::{ProtocolError, Result},
    header::FrameHeader,
};

/// A complete protocol frame.
///
/// # Invariants
///
/// - `payload.len()` equals `header.payload_size()`. Enforced by
///   [`Frame::new`] and verified by [`Frame::decode`].
/// - `payload.len()` never exceeds [`FrameHeader::MAX_PAYLOAD_SIZE`] on the
///   wire; oversized frames are rejected by [`Frame::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// CBOR-encoded body
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame, setting the header's payload size from `payload`.
    ///
    /// Oversized payloads are accepted here and rejected at
    /// [`Frame::encode`], so tests can build frames freely.
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        // Saturate instead of truncating: an oversize claim still fails
        // `encode` and `from_bytes`.
        let payload_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        header.payload_size = payload_len.to_be_bytes();

        Self { header, payload }
    }

    /// Encode as `[header (16 bytes)][payload]`.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + self.payload.len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a frame from wire bytes.
    ///
    /// Validates framing only; the body stays opaque until
    /// [`crate::Message::from_frame`]. Trailing bytes past the claimed payload
    /// are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE + payload_size;

        let Some(body) = bytes.get(FrameHeader::SIZE..total_size) else {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            });
        };

        Ok(Self { header: *header, payload: Bytes::copy_from_slice(body) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameKind;

    #[test]
    fn frame_sets_payload_size() {
        let frame = Frame::new(FrameHeader::new(FrameKind::Request), vec![1, 2, 3, 4]);
        assert_eq!(frame.header.payload_size(), 4);

        let wire = frame.to_vec().unwrap();
        assert_eq!(wire.len(), FrameHeader::SIZE + 4);

        let parsed = Frame::decode(&wire).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn reject_truncated_frame() {
        let frame = Frame::new(FrameHeader::new(FrameKind::Push), vec![0u8; 100]);
        let wire = frame.to_vec().unwrap();

        let result = Frame::decode(&wire[..FrameHeader::SIZE + 10]);
        assert_eq!(result, Err(ProtocolError::FrameTruncated { expected: 100, actual: 10 }));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let frame = Frame::new(FrameHeader::new(FrameKind::Response), vec![7, 7]);
        let mut wire = frame.to_vec().unwrap();
        wire.extend_from_slice(&[0xff; 5]);

        let parsed = Frame::decode(&wire).unwrap();
        assert_eq!(parsed.payload.as_ref(), &[7, 7]);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; FrameHeader::MAX_PAYLOAD_SIZE as usize + 1];
        let frame = Frame::new(FrameHeader::new(FrameKind::Request), payload);
        assert!(matches!(frame.to_vec(), Err(ProtocolError::PayloadTooLarge { .. })));
    }
}
