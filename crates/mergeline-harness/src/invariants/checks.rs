//! Standard invariant checks.
//!
//! These capture what must hold for every interleaving of joins, submits
//! and deliveries, not any particular scenario.

use std::collections::HashMap;

use super::{ClusterSnapshot, Invariant, InvariantResult, Violation};

/// The durable log numbers a document 1..=n with no gaps.
pub struct LogContiguity;

impl Invariant for LogContiguity {
    fn name(&self) -> &'static str {
        "LogContiguity"
    }

    fn check(&self, state: &ClusterSnapshot) -> InvariantResult {
        for (position, &seq) in state.log_sequences.iter().enumerate() {
            let expected = position as u64 + 1;
            if seq != expected {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("log position {position} holds seq {seq}, expected {expected}"),
                });
            }
        }
        Ok(())
    }
}

/// Every replica applies operations in strictly increasing sequence order.
pub struct TotalOrder;

impl Invariant for TotalOrder {
    fn name(&self) -> &'static str {
        "TotalOrder"
    }

    fn check(&self, state: &ClusterSnapshot) -> InvariantResult {
        for replica in &state.replicas {
            if let Some(&first) = replica.applied.first()
                && first <= replica.snapshot_sequence
            {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "replica {} applied seq {first} already covered by its snapshot at {}",
                        replica.index, replica.snapshot_sequence
                    ),
                });
            }

            for window in replica.applied.windows(2) {
                if window[1] <= window[0] {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "replica {} applied seq {} after {}",
                            replica.index, window[1], window[0]
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// No replica skips an operation: applied sequences continue the snapshot
/// one by one and never run past the log.
pub struct GapFreeDelivery;

impl Invariant for GapFreeDelivery {
    fn name(&self) -> &'static str {
        "GapFreeDelivery"
    }

    fn check(&self, state: &ClusterSnapshot) -> InvariantResult {
        let latest = state.log_sequences.last().copied().unwrap_or(0);

        for replica in &state.replicas {
            let mut expected = replica.snapshot_sequence + 1;
            for &seq in &replica.applied {
                if seq != expected {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "replica {} applied seq {seq}, expected {expected}",
                            replica.index
                        ),
                    });
                }
                expected += 1;
            }

            if replica.last_applied() > latest {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "replica {} is at seq {} but the log ends at {latest}",
                        replica.index,
                        replica.last_applied()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Replicas that applied the same prefix render the same document.
pub struct Convergence;

impl Invariant for Convergence {
    fn name(&self) -> &'static str {
        "Convergence"
    }

    fn check(&self, state: &ClusterSnapshot) -> InvariantResult {
        let mut by_position: HashMap<u64, (usize, &str)> = HashMap::new();

        for replica in &state.replicas {
            let position = replica.last_applied();
            match by_position.get(&position) {
                Some(&(index, render)) if render != replica.render => {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "at seq {position}: replica {index} renders {render:?}, replica {} renders {:?}",
                            replica.index, replica.render
                        ),
                    });
                },
                Some(_) => {},
                None => {
                    by_position.insert(position, (replica.index, replica.render.as_str()));
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::ReplicaSnapshot;

    fn create_test_replica(index: usize, applied: Vec<u64>, render: &str) -> ReplicaSnapshot {
        ReplicaSnapshot::new(index, index as u64 + 1).with_applied(applied).with_render(render)
    }

    #[test]
    fn log_gap_detected() {
        let state = ClusterSnapshot::empty().with_log(vec![1, 2, 4]);
        let err = LogContiguity.check(&state).unwrap_err();
        assert!(err.message.contains("seq 4, expected 3"));
    }

    #[test]
    fn reordered_delivery_detected() {
        let state = ClusterSnapshot::empty()
            .with_log(vec![1, 2, 3])
            .with_replica(create_test_replica(0, vec![1, 3, 2], "abc"));

        assert!(TotalOrder.check(&state).is_err());
        assert!(GapFreeDelivery.check(&state).is_err());
    }

    #[test]
    fn reapplying_snapshot_content_detected() {
        let replica = create_test_replica(0, vec![2, 3], "abc").with_snapshot_sequence(2);
        let state = ClusterSnapshot::empty().with_log(vec![1, 2, 3]).with_replica(replica);

        assert!(TotalOrder.check(&state).is_err());
    }

    #[test]
    fn skipped_operation_detected() {
        let replica = create_test_replica(0, vec![4], "abcd").with_snapshot_sequence(2);
        let state = ClusterSnapshot::empty().with_log(vec![1, 2, 3, 4]).with_replica(replica);

        assert!(TotalOrder.check(&state).is_ok());
        let err = GapFreeDelivery.check(&state).unwrap_err();
        assert!(err.message.contains("applied seq 4, expected 3"));
    }

    #[test]
    fn replica_ahead_of_log_detected() {
        let state = ClusterSnapshot::empty()
            .with_log(vec![1])
            .with_replica(create_test_replica(0, vec![1, 2], "ab"));

        assert!(GapFreeDelivery.check(&state).is_err());
    }

    #[test]
    fn divergent_renders_at_same_seq_detected() {
        let state = ClusterSnapshot::empty()
            .with_log(vec![1, 2])
            .with_replica(create_test_replica(0, vec![1, 2], "YX"))
            .with_replica(create_test_replica(1, vec![1, 2], "XY"));

        let err = Convergence.check(&state).unwrap_err();
        assert_eq!(err.invariant, "Convergence");
    }

    #[test]
    fn lagging_replica_is_not_divergent() {
        let state = ClusterSnapshot::empty()
            .with_log(vec![1, 2])
            .with_replica(create_test_replica(0, vec![1, 2], "YX"))
            .with_replica(create_test_replica(1, vec![1], "X"));

        assert!(Convergence.check(&state).is_ok());
    }
}
