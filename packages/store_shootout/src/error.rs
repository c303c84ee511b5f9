use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::WorkerIdentity;

/// Errors that can occur while running a benchmark trial.
///
/// Every variant is fatal to the trial it occurs in. Retrying, if desired, is done by rerunning
/// the whole trial from the populate phase.
///
/// The type is serializable because a worker running in a child process reports its failure to
/// the parent process verbatim.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
#[non_exhaustive]
pub enum Error {
    /// The trial was configured in a way that cannot be executed, such as a zero worker count
    /// or a store that cannot be used with the selected execution strategy.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A worker terminated abnormally. For worker threads this means the worker panicked; for
    /// worker processes this means the process exited without reporting a result.
    #[error("worker {identity} crashed: {detail}")]
    WorkerCrash {
        /// The worker that crashed.
        identity: WorkerIdentity,

        /// Human-readable description of the crash (panic message or exit status).
        detail: String,
    },

    /// A worker did not make progress within the bounded wait, either at a phase barrier or
    /// when being joined. This typically indicates a hung or deadlocked worker.
    #[error("worker {identity} timed out after {waited:?}")]
    WorkerTimeout {
        /// The worker that observed the timeout or failed to complete in time.
        identity: WorkerIdentity,

        /// How long the wait lasted before it was abandoned.
        waited: Duration,
    },

    /// A read phase observed a different amount of data than the write phases stored. This is a
    /// correctness failure of the populate or write phases, not a performance signal.
    #[error(
        "data mismatch in partition of worker {identity}: expected {expected} objects, observed {observed}"
    )]
    DataMismatch {
        /// The worker (and therefore the partition) where the mismatch was observed.
        identity: WorkerIdentity,

        /// How many objects the partition should contain.
        expected: u64,

        /// How many objects the read actually observed.
        observed: u64,
    },

    /// The store backend failed to perform an operation.
    #[error("store operation failed: {0}")]
    Store(String),

    /// The results of a run could not be written out, to a report file or to standard output.
    #[error("cannot write results: {0}")]
    Output(String),
}

impl Error {
    pub(crate) fn store(context: &str, cause: impl fmt::Display) -> Self {
        Self::Store(format!("{context}: {cause}"))
    }

    /// Creates an [`Error::Output`] describing what was being written and why it failed.
    pub fn output(context: &str, cause: impl fmt::Display) -> Self {
        Self::Output(format!("{context}: {cause}"))
    }
}

/// A specialized `Result` type for benchmark operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug, Clone);

    #[test]
    fn survives_process_boundary() {
        let error = Error::DataMismatch {
            identity: WorkerIdentity::new(2),
            expected: 1000,
            observed: 999,
        };

        let wire = serde_json::to_string(&error).unwrap();
        let decoded: Error = serde_json::from_str(&wire).unwrap();

        assert_eq!(decoded, error);
    }

    #[test]
    fn messages_name_the_worker() {
        let error = Error::WorkerCrash {
            identity: WorkerIdentity::new(7),
            detail: "exit status: 3".to_string(),
        };

        assert_eq!(error.to_string(), "worker 7 crashed: exit status: 3");
    }

    #[test]
    fn output_errors_name_the_destination() {
        let error = Error::output("cannot print report", "broken pipe");

        assert_eq!(
            error.to_string(),
            "cannot write results: cannot print report: broken pipe"
        );
    }
}
