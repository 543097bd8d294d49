//! Fuzz target for frame and message decoding
//!
//! Arbitrary bytes from an untrusted client go through the same path the
//! gateway uses: header, frame, then CBOR body.
//!
//! # Invariants
//!
//! - Decoding never panics; malformed input is a structured error
//! - A decoded frame never claims more than `MAX_PAYLOAD_SIZE`
//! - A decoded message re-encodes to a frame that decodes to the same message

#![no_main]

use libfuzzer_sys::fuzz_target;
use mergeline_proto::{Frame, FrameHeader, Message};

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else {
        return;
    };
    assert!(frame.header.payload_size() <= FrameHeader::MAX_PAYLOAD_SIZE);
    assert_eq!(frame.payload.len(), frame.header.payload_size() as usize);

    let Ok(message) = Message::from_frame(&frame) else {
        return;
    };

    let request_id = frame.header.request_id();
    let wire = message.clone().into_frame(request_id).and_then(|f| f.to_vec()).unwrap();
    let reparsed = Frame::decode(&wire).unwrap();

    assert_eq!(reparsed.header.request_id(), request_id);
    assert_eq!(Message::from_frame(&reparsed).unwrap(), message);
});
