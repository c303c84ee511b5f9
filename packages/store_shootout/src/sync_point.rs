use std::sync::Arc;

use tracing::trace;

use crate::process::ParentLink;
use crate::{Barrier, Result, WorkerIdentity};

/// The "wait for everyone" callable handed to every worker, bound to that worker's identity.
///
/// Workers call [`wait()`][Self::wait] immediately before each timed region, so that every
/// worker of the trial starts the region together. How the wait is implemented depends on the
/// execution strategy of the trial: an in-process [`Barrier`] for threads, a message exchange
/// with the parent process for worker processes, or nothing at all for a worker that has no
/// peers.
#[derive(Debug)]
pub struct SyncPoint {
    identity: WorkerIdentity,
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Solo,
    Local(Arc<Barrier>),
    Remote(ParentLink),
}

impl SyncPoint {
    /// A sync point for a worker that has no peers to wait for.
    #[must_use]
    pub fn solo(identity: WorkerIdentity) -> Self {
        Self {
            identity,
            kind: Kind::Solo,
        }
    }

    pub(crate) fn local(identity: WorkerIdentity, barrier: Arc<Barrier>) -> Self {
        Self {
            identity,
            kind: Kind::Local(barrier),
        }
    }

    pub(crate) fn remote(identity: WorkerIdentity, link: ParentLink) -> Self {
        Self {
            identity,
            kind: Kind::Remote(link),
        }
    }

    /// The identity of the worker this sync point belongs to.
    #[must_use]
    pub fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    /// Blocks until every worker of the trial has reached the same point.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::WorkerTimeout`] if the other workers do not arrive in time.
    pub fn wait(&self) -> Result<()> {
        trace!(identity = %self.identity, "arriving at sync point");

        match &self.kind {
            Kind::Solo => Ok(()),
            Kind::Local(barrier) => barrier.arrive_and_wait(self.identity),
            Kind::Remote(link) => link.arrive_and_wait(self.identity),
        }
    }

    /// Synchronizes with every worker, lets only the leader execute `f` and synchronizes again
    /// before anyone continues.
    ///
    /// This is how a side effect on a resource shared by all workers (such as clearing its
    /// caches) is performed exactly once, without any worker observing the resource while the
    /// side effect is in progress.
    ///
    /// # Errors
    ///
    /// Returns the error of either synchronization or of `f`. If `f` fails on the leader, the
    /// leader still does not synchronize the second time, so the other workers will eventually
    /// observe a timeout or the departure of the leader.
    pub fn wait_for_leader_then<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.wait()?;

        if self.identity.is_leader() {
            f()?;
        }

        self.wait()
    }
}
