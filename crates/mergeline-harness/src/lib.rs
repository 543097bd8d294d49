//! Simulation harness for the Mergeline relay.
//!
//! Runs several gateway instances over shared in-memory collaborators and
//! checks that every replica sees the same total order and converges.
//!
//! - [`Cluster`]: gateways, a fanout task, and one [`TextDocument`] replica
//!   per joined session
//! - [`ConvergenceLedger`]: per-round table of replica states with a
//!   reference-replica equality check
//! - [`InvariantRegistry`]: order, gap-freedom and convergence checks over a
//!   [`ClusterSnapshot`]
//! - [`SimEnv`]: seeded RNG and virtual clock

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod invariants;
pub mod ledger;
pub mod model;
pub mod sim_env;

pub use cluster::{Cluster, ClusterConfig, ClusterError, SimGateway};
pub use invariants::{
    ClusterSnapshot, Convergence, GapFreeDelivery, Invariant, InvariantRegistry, InvariantResult,
    LogContiguity, ReplicaSnapshot, TotalOrder, Violation,
};
pub use ledger::{ConvergenceLedger, DivergenceError, LedgerError, LedgerRow};
pub use model::{ModelError, TextDocument, TextEdit};
pub use sim_env::{SimEnv, SimInstant};
