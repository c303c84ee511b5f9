use serde::{Deserialize, Serialize};

/// Identifies one worker within a trial.
///
/// Identities are integers in `[0, concurrency)` and stay stable for the lifetime of a trial.
/// Besides identifying the worker, the identity selects the partition of the benchmark dataset
/// that the worker reads and writes; no two workers share a partition.
///
/// Identity 0 is the leader, the only worker that performs leader-gated side effects.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    derive_more::Display,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(transparent)]
pub struct WorkerIdentity(usize);

impl WorkerIdentity {
    /// The worker that performs leader-gated side effects.
    pub const LEADER: Self = Self(0);

    /// Creates an identity from its index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The index of the worker, also used as its partition key.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Whether this worker is the leader.
    #[must_use]
    pub const fn is_leader(self) -> bool {
        self.0 == Self::LEADER.0
    }

    /// The identities `0..count`, in launch order.
    pub fn range(count: usize) -> impl Iterator<Item = Self> {
        (0..count).map(Self)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn range_is_ordered_from_leader() {
        let identities = WorkerIdentity::range(3).collect::<Vec<_>>();

        assert_eq!(
            identities,
            vec![
                WorkerIdentity::new(0),
                WorkerIdentity::new(1),
                WorkerIdentity::new(2)
            ]
        );
        assert!(identities.first().unwrap().is_leader());
        assert!(!identities.last().unwrap().is_leader());
    }

    #[test]
    fn serializes_as_plain_index() {
        assert_eq!(serde_json::to_string(&WorkerIdentity::new(5)).unwrap(), "5");
    }
}
