use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::process::ProcessWorker;
use crate::{Barrier, Error, Result, SyncPoint, Task, WorkerIdentity};

/// Handle to a launched worker, used to wait for its result.
///
/// Obtained from [`Executor::launch()`][crate::Executor::launch].
#[derive(Debug)]
#[must_use = "a launched worker must be joined to obtain its result and release its resources"]
pub struct WorkerHandle<R> {
    inner: Inner<R>,

    /// Joining gives up on the worker once this instant has passed.
    deadline: Instant,
}

#[derive(Debug)]
enum Inner<R> {
    // Sequential workers have already run to completion by the time they are "launched".
    Completed {
        identity: WorkerIdentity,
        result: Result<R>,
    },
    Thread(ThreadWorker<R>),
    Process(ProcessWorker<R>),
}

impl<R> WorkerHandle<R>
where
    R: DeserializeOwned,
{
    pub(crate) fn completed(identity: WorkerIdentity, result: Result<R>, deadline: Instant) -> Self {
        Self {
            inner: Inner::Completed { identity, result },
            deadline,
        }
    }

    pub(crate) fn thread(worker: ThreadWorker<R>, deadline: Instant) -> Self {
        Self {
            inner: Inner::Thread(worker),
            deadline,
        }
    }

    pub(crate) fn process(worker: ProcessWorker<R>, deadline: Instant) -> Self {
        Self {
            inner: Inner::Process(worker),
            deadline,
        }
    }

    /// The identity of the worker.
    #[must_use]
    pub fn identity(&self) -> WorkerIdentity {
        match &self.inner {
            Inner::Completed { identity, .. } => *identity,
            Inner::Thread(worker) => worker.identity,
            Inner::Process(worker) => worker.identity(),
        }
    }

    /// Blocks until the worker finishes and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the error the worker failed with, [`Error::WorkerCrash`] if it terminated
    /// abnormally or [`Error::WorkerTimeout`] if it did not finish before the trial deadline.
    pub fn join(self) -> Result<R> {
        let identity = self.identity();

        let result = match self.inner {
            Inner::Completed { result, .. } => result,
            Inner::Thread(worker) => worker.join(self.deadline),
            Inner::Process(worker) => worker.join(self.deadline),
        };

        debug!(%identity, succeeded = result.is_ok(), "worker joined");

        result
    }
}

/// A worker running on a dedicated thread of the current process.
#[derive(derive_more::Debug)]
pub(crate) struct ThreadWorker<R> {
    identity: WorkerIdentity,
    started: Instant,

    #[debug(ignore)]
    thread: JoinHandle<()>,
    #[debug(ignore)]
    result_rx: oneshot::Receiver<Result<R>>,

    barrier: Arc<Barrier>,
}

impl<R> ThreadWorker<R>
where
    R: Send + 'static,
{
    pub(crate) fn spawn<T>(task: &Arc<T>, identity: WorkerIdentity, barrier: &Arc<Barrier>) -> Result<Self>
    where
        T: Task<Output = R> + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(format!("shootout-worker-{identity}"))
            .spawn({
                let task = Arc::clone(task);
                let barrier = Arc::clone(barrier);

                move || {
                    // Whether we finish or crash, we will not be arriving at the barrier again.
                    let barrier = scopeguard::guard(barrier, |barrier| barrier.depart());

                    let sync = SyncPoint::local(identity, Arc::clone(&*barrier));
                    let result = run_guarded(&*task, identity, &sync);

                    drop(result_tx.send(result));
                }
            })
            .map_err(|e| Error::WorkerCrash {
                identity,
                detail: format!("failed to start worker thread: {e}"),
            })?;

        debug!(%identity, "worker thread started");

        Ok(Self {
            identity,
            started: Instant::now(),
            thread,
            result_rx,
            barrier: Arc::clone(barrier),
        })
    }
}

impl<R> ThreadWorker<R> {
    fn join(self, deadline: Instant) -> Result<R> {
        let remaining = deadline.saturating_duration_since(Instant::now());

        match self.result_rx.recv_timeout(remaining) {
            Ok(result) => {
                if self.thread.join().is_err() {
                    // Impossible in practice: the task itself runs under a panic guard.
                    warn!(identity = %self.identity, "worker thread panicked after reporting");
                }

                result
            }
            Err(oneshot::RecvTimeoutError::Timeout) => {
                warn!(identity = %self.identity, "worker thread did not finish in time");

                // Wakes up the worker if it is the one stuck on the barrier and fails everyone
                // else waiting for it. A worker stuck elsewhere cannot be stopped and is detached.
                self.barrier.break_barrier();

                Err(Error::WorkerTimeout {
                    identity: self.identity,
                    waited: self.started.elapsed(),
                })
            }
            Err(oneshot::RecvTimeoutError::Disconnected) => {
                let detail = match self.thread.join() {
                    Err(payload) => panic_message(&*payload),
                    Ok(()) => "worker thread exited without a result".to_string(),
                };

                Err(Error::WorkerCrash {
                    identity: self.identity,
                    detail,
                })
            }
        }
    }
}

/// Runs a task, converting a panic into [`Error::WorkerCrash`].
pub(crate) fn run_guarded<T>(task: &T, identity: WorkerIdentity, sync: &SyncPoint) -> Result<T::Output>
where
    T: Task + ?Sized,
{
    panic::catch_unwind(AssertUnwindSafe(|| task.run(identity, sync))).unwrap_or_else(|payload| {
        Err(Error::WorkerCrash {
            identity,
            detail: format!("panicked: {}", panic_message(&*payload)),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use testing::with_watchdog;

    use super::*;
    use crate::task_fn;

    const GENEROUS: Duration = Duration::from_secs(5);

    fn far_deadline() -> Instant {
        Instant::now().checked_add(GENEROUS).unwrap()
    }

    #[test]
    fn panic_becomes_crash() {
        let identity = WorkerIdentity::new(1);
        let task = task_fn(|_: WorkerIdentity, _: &SyncPoint| -> Result<()> {
            panic!("store exploded");
        });

        let result = run_guarded(&task, identity, &SyncPoint::solo(identity));

        match result {
            Err(Error::WorkerCrash { identity: crashed, detail }) => {
                assert_eq!(crashed, identity);
                assert!(detail.contains("store exploded"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn thread_worker_reports_result() {
        with_watchdog(|| {
            let barrier = Arc::new(Barrier::new(1, GENEROUS).unwrap());
            let task = Arc::new(task_fn(|identity: WorkerIdentity, sync: &SyncPoint| {
                sync.wait()?;
                Ok(identity.index() + 1)
            }));

            let worker = ThreadWorker::spawn(&task, WorkerIdentity::new(4), &barrier).unwrap();
            let handle = WorkerHandle::thread(worker, far_deadline());

            assert_eq!(handle.identity(), WorkerIdentity::new(4));
            assert_eq!(handle.join().unwrap(), 5);
        });
    }

    #[test]
    fn crashed_thread_departs_barrier() {
        with_watchdog(|| {
            let barrier = Arc::new(Barrier::new(2, GENEROUS).unwrap());

            let crasher = Arc::new(task_fn(|_: WorkerIdentity, _: &SyncPoint| -> Result<()> {
                panic!("gone before the first phase");
            }));
            let survivor = Arc::new(task_fn(|_: WorkerIdentity, sync: &SyncPoint| {
                sync.wait()?;
                sync.wait()
            }));

            let crashed = ThreadWorker::spawn(&crasher, WorkerIdentity::new(0), &barrier).unwrap();
            let survived = ThreadWorker::spawn(&survivor, WorkerIdentity::new(1), &barrier).unwrap();

            assert!(matches!(
                WorkerHandle::thread(crashed, far_deadline()).join(),
                Err(Error::WorkerCrash { .. })
            ));
            WorkerHandle::thread(survived, far_deadline()).join().unwrap();
        });
    }

    #[test]
    fn hung_thread_times_out() {
        with_watchdog(|| {
            let barrier = Arc::new(Barrier::new(2, GENEROUS).unwrap());

            // Waits for a peer that never comes; only the join deadline can end this.
            let task = Arc::new(task_fn(|_: WorkerIdentity, sync: &SyncPoint| sync.wait()));

            let worker = ThreadWorker::spawn(&task, WorkerIdentity::new(0), &barrier).unwrap();
            let deadline = Instant::now().checked_add(Duration::from_millis(50)).unwrap();

            let result = WorkerHandle::thread(worker, deadline).join();

            assert!(matches!(result, Err(Error::WorkerTimeout { .. })));
            assert!(barrier.is_broken());
        });
    }

    #[test]
    fn completed_handle_returns_stored_result() {
        let handle = WorkerHandle::completed(WorkerIdentity::new(2), Ok(7_u32), far_deadline());

        assert_eq!(handle.identity(), WorkerIdentity::new(2));
        assert_eq!(handle.join().unwrap(), 7);
    }
}
