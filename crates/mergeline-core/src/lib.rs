//! Mergeline core logic.
//!
//! Pure state machines shared by the gateway and by test replicas. Nothing
//! here performs I/O: callers feed sequenced operations in and get ordered
//! deliveries (or typed errors) back.
//!
//! - [`delivery::DeliveryBuffer`]: per-document reordering window that
//!   releases operations strictly in sequence order and drops redeliveries.
//! - [`replica::Replica`]: a document replica built from a bootstrap view
//!   that applies the ordered stream idempotently.
//! - [`env::Environment`]: time and randomness abstraction so the same code
//!   runs under the system clock or a seeded simulation.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod delivery;
pub mod env;
pub mod replica;

pub use delivery::{Admission, DeliveryBuffer, DeliveryError};
pub use env::Environment;
pub use replica::{DocumentModel, Replica, ReplicaError, ReplicaEvent};
