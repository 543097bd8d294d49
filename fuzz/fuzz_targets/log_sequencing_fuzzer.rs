//! Fuzz target for per-document sequence assignment
//!
//! # Strategy
//!
//! - Interleave appends across a handful of documents
//! - Wrap the log in `ChaoticLog` so some appends fail
//!
//! # Invariants
//!
//! - Every document is numbered 1..=n in submission order
//! - A failed append assigns no number
//! - Documents never share or skip numbers because of each other

#![no_main]

use std::collections::HashMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mergeline_proto::{DocumentId, Operation};
use mergeline_server::storage::{ChaoticLog, DurableLog, MemoryLog};

#[derive(Debug, Arbitrary)]
struct Input {
    seed: u64,
    failure_percent: u8,
    appends: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let failure_rate = f64::from(input.failure_percent % 100) / 100.0;
    let log = ChaoticLog::with_seed(MemoryLog::new(), failure_rate, input.seed);
    let mut accepted: HashMap<u8, Vec<u64>> = HashMap::new();

    for (client_seq, document) in input.appends.iter().enumerate() {
        let document = document % 4;
        let document_id = DocumentId::new(format!("doc-{document}")).unwrap();
        let op = Operation::new(document_id.clone(), 1, client_seq as u64, Vec::new());

        if log.append(&document_id, op).is_ok() {
            accepted.entry(document).or_default().push(client_seq as u64);
        }
    }

    for (document, expected) in accepted {
        let document_id = DocumentId::new(format!("doc-{document}")).unwrap();
        let entries = log.inner().read_from(&document_id, 0).unwrap();

        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, (1..=expected.len() as u64).collect::<Vec<_>>());

        let order: Vec<u64> = entries.iter().map(|e| e.operation.client_seq).collect();
        assert_eq!(order, expected);
    }
});
