use serde::{Deserialize, Serialize};

/// How the workers of a trial are executed.
///
/// The strategy decides both how each worker is scheduled and whether the workers share one
/// handle to the store under test or each open their own.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, derive_more::Display, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ExecutionStrategy {
    /// Every worker runs to completion on the calling thread, one after another. Workers never
    /// wait for each other, as there is nobody to wait for.
    #[display("sequential")]
    SingleProcessSequential,

    /// Every worker runs in its own operating system process with its own store handle.
    #[default]
    #[display("processes")]
    MultiProcess,

    /// Every worker runs on its own thread and all of them share one store handle.
    #[display("threads (shared store handle)")]
    ThreadsSharedResource,

    /// Every worker runs on its own thread with its own handle to the same store.
    #[display("threads (store handle per worker)")]
    ThreadsPerWorkerResource,
}

impl ExecutionStrategy {
    /// Whether all workers use one shared store handle.
    ///
    /// When they do, side effects on the handle must be leader-gated (see
    /// [`SyncPoint::wait_for_leader_then()`][crate::SyncPoint::wait_for_leader_then]).
    #[must_use]
    pub fn shares_store_handle(self) -> bool {
        matches!(self, Self::ThreadsSharedResource)
    }

    /// Whether workers run on threads of the current process.
    #[must_use]
    pub fn uses_threads(self) -> bool {
        matches!(
            self,
            Self::ThreadsSharedResource | Self::ThreadsPerWorkerResource
        )
    }

    /// Whether workers run in their own address space.
    #[must_use]
    pub fn uses_processes(self) -> bool {
        matches!(self, Self::MultiProcess)
    }
}
