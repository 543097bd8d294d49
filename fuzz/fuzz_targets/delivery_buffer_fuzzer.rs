//! Fuzz target for the delivery buffer
//!
//! Feeds arbitrary interleavings of fresh, duplicate and far-ahead sequence
//! numbers, as a flaky pub/sub would.
//!
//! # Invariants
//!
//! - Released operations are exactly last+1, last+2, ... with no gaps
//! - Nothing at or below the last released number is released again
//! - The hold limit is never exceeded; refusals leave the buffer unchanged

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mergeline_core::{Admission, DeliveryBuffer, DeliveryError};
use mergeline_proto::{DocumentId, Operation, SequencedOperation};

#[derive(Debug, Arbitrary)]
struct Input {
    start: u8,
    max_held: u8,
    offers: Vec<Offer>,
}

#[derive(Debug, Arbitrary)]
enum Offer {
    /// Offset from the next expected number
    Ahead(u8),
    /// Offset below the last released number
    Behind(u8),
    Exact,
}

fuzz_target!(|input: Input| {
    let document_id = DocumentId::new("fuzz").unwrap();
    let max_held = usize::from(input.max_held % 32) + 1;
    let mut buffer = DeliveryBuffer::new(u64::from(input.start) + 1, max_held);
    let mut released = buffer.last_delivered();

    for offer in input.offers {
        let seq = match offer {
            Offer::Ahead(n) => buffer.next_expected() + u64::from(n),
            Offer::Behind(n) => buffer.last_delivered().saturating_sub(u64::from(n)).max(1),
            Offer::Exact => buffer.next_expected(),
        };
        let op = SequencedOperation::new(seq, Operation::new(document_id.clone(), 1, seq, Vec::new()));

        let held_before = buffer.held_len();
        match buffer.accept(op) {
            Ok(Admission::Ready(ops)) => {
                for op in ops {
                    assert_eq!(op.sequence_number, released + 1, "gap in released stream");
                    released = op.sequence_number;
                }
            },
            Ok(Admission::Held { expected, received }) => {
                assert!(received > expected);
                assert_eq!(buffer.held_len(), held_before + 1);
            },
            Ok(Admission::Duplicate) => assert_eq!(buffer.held_len(), held_before),
            Err(DeliveryError::HoldLimitExceeded { held, max, .. }) => {
                assert_eq!(held, max);
                assert_eq!(buffer.held_len(), held_before);
            },
        }

        assert_eq!(buffer.last_delivered(), released);
        assert!(buffer.held_len() <= max_held);
    }
});
