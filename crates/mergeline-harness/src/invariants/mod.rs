//! Invariant checking for cluster simulations.
//!
//! Invariants are properties that must hold after every step of a run. The
//! cluster captures its observable state as a [`ClusterSnapshot`] and the
//! registered [`Invariant`]s are checked against it.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! registry.assert_all(&cluster.snapshot()?, "after round 3");
//! ```

mod checks;
mod snapshot;

pub use checks::{Convergence, GapFreeDelivery, LogContiguity, TotalOrder};
pub use snapshot::{ClusterSnapshot, ReplicaSnapshot};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against cluster state.
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against a snapshot.
    fn check(&self, state: &ClusterSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
///
/// Every registered invariant runs on every check; one failing does not
/// hide the others.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with the standard relay invariants:
    ///
    /// - [`LogContiguity`]: the log is numbered 1..=n
    /// - [`TotalOrder`]: replicas apply in increasing sequence order
    /// - [`GapFreeDelivery`]: replicas never skip an operation
    /// - [`Convergence`]: equal prefixes render equally
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(LogContiguity);
        registry.add(TotalOrder);
        registry.add(GapFreeDelivery);
        registry.add(Convergence);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants, returning every violation found.
    pub fn check_all(&self, state: &ClusterSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation and `context`
    /// (typically the round or step just executed).
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &ClusterSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(|v| v.to_string()).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Names of the registered invariants, in check order.
    pub fn names(&self) -> Vec<&'static str> {
        self.invariants.iter().map(|inv| inv.name()).collect()
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
