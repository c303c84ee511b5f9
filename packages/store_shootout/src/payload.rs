use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::WorkerIdentity;

// Object payloads are made of real words so that stores which compress their data see
// realistic input instead of a run of identical bytes.
const WORDS: &[&str] = &[
    "barrier", "worker", "phase", "commit", "partition", "object", "cache", "connection",
    "transaction", "store", "read", "write", "update", "warm", "cold", "hot", "steam",
    "populate", "leader", "follower", "release", "arrive", "depart", "timeout", "trial",
    "repetition", "sample", "latency", "concurrency", "thread", "process", "handle", "pool",
    "minimize", "clear", "decode", "encode", "journal", "serial", "version", "snapshot",
    "index", "mapping", "persistent", "durable", "atomic", "replace", "directory", "memory",
    "payload", "generator", "seed", "random", "corpus", "benchmark", "contender", "report",
    "mean", "median", "spread", "lock", "step", "parent", "child", "relay", "message",
];

/// Produces the pseudo-random payloads that workers store.
///
/// Generators are deterministic: the same seed, worker and repetition always produce the same
/// payloads, while different workers and repetitions produce different ones.
#[derive(Debug)]
pub struct PayloadGenerator {
    rng: StdRng,
}

impl PayloadGenerator {
    /// Creates the generator used by `identity` in trial repetition `rep` of a run seeded
    /// with `seed`.
    #[must_use]
    pub fn new(seed: u64, identity: WorkerIdentity, rep: u64) -> Self {
        // Spread the inputs over the whole seed space so neighboring workers and repetitions do
        // not get correlated streams.
        let mixed = seed
            .wrapping_add((identity.index() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .wrapping_add(rep.wrapping_mul(0xBF58_476D_1CE4_E5B9));

        Self {
            rng: StdRng::seed_from_u64(mixed),
        }
    }

    /// Generates one payload of exactly `size` bytes.
    pub fn payload(&mut self, size: usize) -> String {
        let mut data = String::with_capacity(size);

        while data.len() < size {
            if !data.is_empty() {
                data.push(' ');
            }

            let word = WORDS
                .get(self.rng.random_range(0..WORDS.len()))
                .expect("index is drawn from the valid range");
            data.push_str(word);
        }

        // Every word is ASCII, so any length is a character boundary.
        data.truncate(size);
        data
    }

    /// Generates `count` payloads of `size` bytes each.
    pub fn payloads(&mut self, count: usize, size: usize) -> Vec<String> {
        (0..count).map(|_| self.payload(size)).collect()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn payloads_have_requested_size() {
        let mut generator = PayloadGenerator::new(1, WorkerIdentity::LEADER, 0);

        for size in [0, 1, 7, 128, 4096] {
            assert_eq!(generator.payload(size).len(), size);
        }
    }

    #[test]
    fn same_inputs_same_payloads() {
        let a = PayloadGenerator::new(42, WorkerIdentity::new(3), 5).payloads(10, 64);
        let b = PayloadGenerator::new(42, WorkerIdentity::new(3), 5).payloads(10, 64);

        assert_eq!(a, b);
    }

    #[test]
    fn workers_and_repetitions_differ() {
        let base = PayloadGenerator::new(42, WorkerIdentity::new(0), 0).payloads(10, 64);
        let other_worker = PayloadGenerator::new(42, WorkerIdentity::new(1), 0).payloads(10, 64);
        let other_rep = PayloadGenerator::new(42, WorkerIdentity::new(0), 1).payloads(10, 64);

        assert_ne!(base, other_worker);
        assert_ne!(base, other_rep);
    }

    #[test]
    fn payloads_are_words() {
        let payload = PayloadGenerator::new(7, WorkerIdentity::LEADER, 0).payload(1000);

        // All but the possibly truncated last word come from the corpus.
        let words = payload.split(' ').collect::<Vec<_>>();
        for word in words.iter().take(words.len().saturating_sub(1)) {
            assert!(WORDS.contains(word), "{word}");
        }
    }
}
