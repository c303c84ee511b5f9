use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info_span};

use crate::process::ProcessWorker;
use crate::worker::{ThreadWorker, run_guarded};
use crate::{
    Barrier, ChildProgram, Error, ExecutionStrategy, Result, SyncPoint, Task, WorkerHandle,
    WorkerIdentity,
};

/// Default bound on how long a worker waits at a phase barrier for its peers.
pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(120);

/// Default bound on how long joining the workers of one trial may take in total.
pub const DEFAULT_TRIAL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Runs workers according to an [`ExecutionStrategy`].
///
/// This is the trial orchestrator: [`distribute()`][Self::distribute] runs one worker per
/// identity in lock-step and collects their results, while
/// [`run_isolated()`][Self::run_isolated] runs a one-shot setup task in a throwaway worker
/// context.
///
/// # Timeouts
///
/// Two bounds protect against workers that hang or crash without being noticed:
///
/// * Every wait at a phase barrier is bounded by the barrier timeout. When it expires the trial's
///   barrier breaks and every worker waiting on it fails with [`Error::WorkerTimeout`].
/// * Joining a worker is bounded by the trial timeout, counted from the moment that worker was
///   launched. A worker process still running past that point is killed; a
///   worker thread cannot be stopped, so it is detached after its barrier is broken.
///
/// Neither bound applies to [`ExecutionStrategy::SingleProcessSequential`], whose workers run
/// on the calling thread.
///
/// # Examples
///
/// ```
/// use store_shootout::{ExecutionStrategy, Executor, WorkerIdentity, task_fn};
///
/// let executor = Executor::new(ExecutionStrategy::ThreadsSharedResource);
///
/// let results = executor
///     .distribute(
///         task_fn(|identity: WorkerIdentity, sync| {
///             sync.wait()?;
///             Ok(identity.index() * 10)
///         }),
///         &WorkerIdentity::range(3).collect::<Vec<_>>(),
///     )
///     .unwrap();
///
/// assert_eq!(results, vec![0, 10, 20]);
/// ```
#[derive(Clone, Debug)]
pub struct Executor {
    strategy: ExecutionStrategy,
    child_program: ChildProgram,
    barrier_timeout: Duration,
    trial_timeout: Duration,
}

impl Executor {
    /// Creates an executor for the given strategy with default timeouts, re-executing the
    /// current program to create worker processes.
    #[must_use]
    pub fn new(strategy: ExecutionStrategy) -> Self {
        Self {
            strategy,
            child_program: ChildProgram::current_exe(),
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
            trial_timeout: DEFAULT_TRIAL_TIMEOUT,
        }
    }

    /// Sets the program started for each worker process.
    #[must_use]
    pub fn with_child_program(mut self, child_program: ChildProgram) -> Self {
        self.child_program = child_program;
        self
    }

    /// Sets how long a worker may wait at a phase barrier.
    #[must_use]
    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    /// Sets how long joining the workers of one trial may take.
    #[must_use]
    pub fn with_trial_timeout(mut self, timeout: Duration) -> Self {
        self.trial_timeout = timeout;
        self
    }

    /// The strategy used to execute workers.
    #[must_use]
    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Launches one worker executing `task` and synchronizing on `barrier`.
    ///
    /// Sequential workers run to completion before this returns and ignore the barrier, as
    /// they have no peers running at the same time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the strategy uses processes and the task cannot
    /// cross a process boundary, or [`Error::WorkerCrash`] if the worker cannot be started.
    pub fn launch<T>(
        &self,
        task: &Arc<T>,
        identity: WorkerIdentity,
        barrier: &Arc<Barrier>,
    ) -> Result<WorkerHandle<T::Output>>
    where
        T: Task + 'static,
    {
        let deadline = self.deadline();

        match self.strategy {
            ExecutionStrategy::SingleProcessSequential => {
                let result = run_guarded(&**task, identity, &SyncPoint::solo(identity));
                Ok(WorkerHandle::completed(identity, result, deadline))
            }
            ExecutionStrategy::MultiProcess => {
                let envelope = task.envelope()?.ok_or_else(|| {
                    Error::Configuration(
                        "the task can only run in-process and cannot be distributed to worker processes"
                            .to_string(),
                    )
                })?;

                let worker = ProcessWorker::spawn(&self.child_program, &envelope, identity, barrier)?;
                Ok(WorkerHandle::process(worker, deadline))
            }
            ExecutionStrategy::ThreadsSharedResource
            | ExecutionStrategy::ThreadsPerWorkerResource => {
                let worker = ThreadWorker::spawn(task, identity, barrier)?;
                Ok(WorkerHandle::thread(worker, deadline))
            }
        }
    }

    /// Runs one worker per identity, all crossing their phase boundaries in lock-step, and
    /// returns their results in the order of `identities`.
    ///
    /// If any worker fails, the remaining workers are still joined before the first failure
    /// is returned. No partial results are ever returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `identities` is not a permutation of `0..n` for some
    /// non-zero `n` (empty, duplicated or out of range identities), or the
    /// first error any worker failed with.
    pub fn distribute<T>(&self, task: T, identities: &[WorkerIdentity]) -> Result<Vec<T::Output>>
    where
        T: Task + 'static,
    {
        validate_identities(identities)?;

        let _span = info_span!("distribute", strategy = %self.strategy, workers = identities.len())
            .entered();

        let barrier = Arc::new(Barrier::new(identities.len(), self.barrier_timeout)?);
        let task = Arc::new(task);

        let mut handles = Vec::with_capacity(identities.len());

        for &identity in identities {
            match self.launch(&task, identity, &barrier) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // The workers already running would otherwise wait for this one in vain.
                    barrier.break_barrier();

                    for handle in handles {
                        drop(handle.join());
                    }

                    return Err(e);
                }
            }
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;

        for handle in handles {
            match handle.join() {
                Ok(result) => results.push(result),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => debug!(error = %e, "additional worker failure in failed trial"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Runs `task` once, in a fresh worker context of the strategy's flavor, and tears the
    /// context down before returning.
    ///
    /// This keeps one-time setup work (such as populating the store) out of every worker
    /// that is later measured: a worker process exits and takes its caches with it, a worker
    /// thread drops its store handle. Under the sequential strategy the task runs on the
    /// calling thread.
    ///
    /// # Errors
    ///
    /// Returns the error of the task or of its worker context.
    pub fn run_isolated<T>(&self, task: T) -> Result<T::Output>
    where
        T: Task + 'static,
    {
        let _span = info_span!("run_isolated", strategy = %self.strategy).entered();

        let barrier = Arc::new(Barrier::new(1, self.barrier_timeout)?);

        self.launch(&Arc::new(task), WorkerIdentity::LEADER, &barrier)?
            .join()
    }

    fn deadline(&self) -> Instant {
        Instant::now()
            .checked_add(self.trial_timeout)
            .unwrap_or_else(far_future)
    }
}

#[cfg_attr(test, mutants::skip)] // Only reachable with absurd timeouts.
fn far_future() -> Instant {
    // Roughly a century; far enough to never matter, near enough to never overflow.
    Instant::now()
        .checked_add(Duration::from_secs(100 * 365 * 24 * 60 * 60))
        .expect("a century fits in an Instant on every supported platform")
}

fn validate_identities(identities: &[WorkerIdentity]) -> Result<()> {
    if identities.is_empty() {
        return Err(Error::Configuration(
            "a trial requires at least one worker".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(identities.len());

    for identity in identities {
        // Identities double as partition keys and identity 0 performs leader-gated work, so a
        // pool of n workers must consist of exactly the identities 0..n.
        if identity.index() >= identities.len() {
            return Err(Error::Configuration(format!(
                "worker identity {identity} is outside the range 0..{} of a {}-worker trial",
                identities.len(),
                identities.len()
            )));
        }

        if !seen.insert(identity) {
            return Err(Error::Configuration(format!(
                "worker identity {identity} appears more than once"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    use testing::{timestamp_spread, with_watchdog};

    use super::*;
    use crate::task_fn;

    const IN_PROCESS_STRATEGIES: [ExecutionStrategy; 3] = [
        ExecutionStrategy::SingleProcessSequential,
        ExecutionStrategy::ThreadsSharedResource,
        ExecutionStrategy::ThreadsPerWorkerResource,
    ];

    fn identities(count: usize) -> Vec<WorkerIdentity> {
        WorkerIdentity::range(count).collect()
    }

    #[test]
    fn results_follow_identity_order_not_completion_order() {
        with_watchdog(|| {
            for strategy in IN_PROCESS_STRATEGIES {
                for count in 1..=5 {
                    let results = Executor::new(strategy)
                        .distribute(
                            task_fn(move |identity: WorkerIdentity, sync| {
                                sync.wait()?;
                                // Lower identities finish last.
                                let delay = (count - identity.index()) as u64 * 5;
                                thread::sleep(Duration::from_millis(delay));
                                Ok(identity.index())
                            }),
                            &identities(count),
                        )
                        .unwrap();

                    assert_eq!(results, (0..count).collect::<Vec<_>>(), "{strategy}");
                }
            }
        });
    }

    #[test]
    fn three_workers_times_ten() {
        with_watchdog(|| {
            for strategy in IN_PROCESS_STRATEGIES {
                let results = Executor::new(strategy)
                    .distribute(
                        task_fn(|identity: WorkerIdentity, sync| {
                            sync.wait()?;
                            Ok(identity.index() * 10)
                        }),
                        &identities(3),
                    )
                    .unwrap();

                assert_eq!(results, vec![0, 10, 20], "{strategy}");
            }
        });
    }

    #[test]
    fn single_worker_runs_exactly_once() {
        with_watchdog(|| {
            for strategy in IN_PROCESS_STRATEGIES {
                let calls = Arc::new(AtomicUsize::new(0));

                let results = Executor::new(strategy)
                    .distribute(
                        task_fn({
                            let calls = Arc::clone(&calls);
                            move |identity: WorkerIdentity, sync| {
                                assert_eq!(identity, WorkerIdentity::LEADER);
                                calls.fetch_add(1, Ordering::SeqCst);
                                sync.wait()?;
                                Ok("done".to_string())
                            }
                        }),
                        &identities(1),
                    )
                    .unwrap();

                assert_eq!(results, vec!["done".to_string()]);
                assert_eq!(calls.load(Ordering::SeqCst), 1);
            }
        });
    }

    #[test]
    fn threads_cross_phases_together() {
        with_watchdog(|| {
            const WORKERS: usize = 4;

            let origin = Instant::now();

            let results = Executor::new(ExecutionStrategy::ThreadsPerWorkerResource)
                .distribute(
                    task_fn(move |identity: WorkerIdentity, sync| {
                        let mut crossings = Vec::new();
                        for _ in 0..3 {
                            thread::sleep(Duration::from_millis(identity.index() as u64 * 3));
                            sync.wait()?;
                            crossings.push(origin.elapsed());
                        }
                        Ok(crossings)
                    }),
                    &identities(WORKERS),
                )
                .unwrap();

            for phase in 0..3 {
                let crossed_at = results
                    .iter()
                    .map(|crossings| origin.checked_add(*crossings.get(phase).unwrap()).unwrap())
                    .collect::<Vec<_>>();

                assert!(timestamp_spread(&crossed_at) < Duration::from_millis(50));
            }
        });
    }

    #[test]
    fn panicking_worker_fails_trial_after_joining_everyone() {
        with_watchdog(|| {
            let finished = Arc::new(AtomicUsize::new(0));

            let result = Executor::new(ExecutionStrategy::ThreadsSharedResource).distribute(
                task_fn({
                    let finished = Arc::clone(&finished);
                    move |identity: WorkerIdentity, sync| {
                        sync.wait()?;
                        assert!(identity.index() != 1, "worker 1 fails the write phase");
                        sync.wait()?;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                &identities(3),
            );

            match result {
                Err(Error::WorkerCrash { identity, .. }) => {
                    assert_eq!(identity, WorkerIdentity::new(1));
                }
                other => panic!("unexpected result: {other:?}"),
            }

            // Both survivors ran to completion and were joined before distribute() returned.
            assert_eq!(finished.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn worker_error_is_returned_verbatim() {
        with_watchdog(|| {
            let result = Executor::new(ExecutionStrategy::ThreadsPerWorkerResource).distribute(
                task_fn(|identity: WorkerIdentity, sync| {
                    sync.wait()?;
                    if identity.index() == 2 {
                        return Err(Error::DataMismatch {
                            identity,
                            expected: 1000,
                            observed: 999,
                        });
                    }
                    Ok(())
                }),
                &identities(3),
            );

            assert!(matches!(
                result,
                Err(Error::DataMismatch { observed: 999, .. })
            ));
        });
    }

    #[test]
    fn hung_worker_times_out_instead_of_hanging() {
        with_watchdog(|| {
            let result = Executor::new(ExecutionStrategy::ThreadsPerWorkerResource)
                .with_barrier_timeout(Duration::from_millis(100))
                .distribute(
                    task_fn(|identity: WorkerIdentity, sync| {
                        if identity.is_leader() {
                            // Never shows up at the barrier while the others wait.
                            thread::sleep(Duration::from_millis(500));
                            return Ok(());
                        }
                        sync.wait()
                    }),
                    &identities(3),
                );

            assert!(matches!(result, Err(Error::WorkerTimeout { .. })));
        });
    }

    #[test]
    fn invalid_identities_are_rejected() {
        let executor = Executor::new(ExecutionStrategy::ThreadsPerWorkerResource);
        let task = || task_fn(|_: WorkerIdentity, _: &SyncPoint| Ok(()));

        assert!(matches!(
            executor.distribute(task(), &[]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            executor.distribute(task(), &[WorkerIdentity::LEADER, WorkerIdentity::LEADER]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn identities_outside_pool_range_are_rejected() {
        let executor = Executor::new(ExecutionStrategy::ThreadsSharedResource);
        let gated_calls = Arc::new(AtomicUsize::new(0));

        let result = executor.distribute(
            task_fn({
                let gated_calls = Arc::clone(&gated_calls);
                move |_: WorkerIdentity, sync: &SyncPoint| {
                    sync.wait_for_leader_then(|| {
                        gated_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }
            }),
            &[WorkerIdentity::new(1), WorkerIdentity::new(2)],
        );

        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(gated_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn permuted_identities_run_leader_gate_once() {
        with_watchdog(|| {
            let gated_calls = Arc::new(AtomicUsize::new(0));
            let order = [
                WorkerIdentity::new(2),
                WorkerIdentity::LEADER,
                WorkerIdentity::new(1),
            ];

            let results = Executor::new(ExecutionStrategy::ThreadsSharedResource)
                .distribute(
                    task_fn({
                        let gated_calls = Arc::clone(&gated_calls);
                        move |identity: WorkerIdentity, sync: &SyncPoint| {
                            sync.wait_for_leader_then(|| {
                                gated_calls.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })?;
                            Ok(identity.index())
                        }
                    }),
                    &order,
                )
                .unwrap();

            assert_eq!(results, vec![2, 0, 1]);
            assert_eq!(gated_calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn huge_barrier_timeout_does_not_fail_trial() {
        with_watchdog(|| {
            let results = Executor::new(ExecutionStrategy::ThreadsPerWorkerResource)
                .with_barrier_timeout(Duration::from_secs(u64::MAX))
                .distribute(
                    task_fn(|identity: WorkerIdentity, sync: &SyncPoint| {
                        sync.wait()?;
                        sync.wait()?;
                        Ok(identity.index())
                    }),
                    &identities(2),
                )
                .unwrap();

            assert_eq!(results, vec![0, 1]);
        });
    }

    #[test]
    fn closures_cannot_run_in_processes() {
        let result = Executor::new(ExecutionStrategy::MultiProcess).distribute(
            task_fn(|_: WorkerIdentity, _: &SyncPoint| Ok(())),
            &identities(2),
        );

        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn isolated_setup_is_visible_but_not_measured() {
        with_watchdog(|| {
            for strategy in IN_PROCESS_STRATEGIES {
                let setup_runs = Arc::new(AtomicUsize::new(0));
                let setup_thread = Arc::new(Mutex::new(None));

                Executor::new(strategy)
                    .run_isolated(task_fn({
                        let setup_runs = Arc::clone(&setup_runs);
                        let setup_thread = Arc::clone(&setup_thread);
                        move |_: WorkerIdentity, sync: &SyncPoint| {
                            sync.wait()?;
                            thread::sleep(Duration::from_millis(200));
                            *setup_thread.lock().unwrap() = Some(thread::current().id());
                            setup_runs.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }))
                    .unwrap();

                let measured = Executor::new(strategy)
                    .distribute(
                        task_fn({
                            let setup_runs = Arc::clone(&setup_runs);
                            move |_: WorkerIdentity, sync| {
                                sync.wait()?;
                                let start = Instant::now();
                                let observed = setup_runs.load(Ordering::SeqCst);
                                Ok((observed, start.elapsed()))
                            }
                        }),
                        &identities(2),
                    )
                    .unwrap();

                for (observed, elapsed) in measured {
                    assert_eq!(observed, 1, "{strategy}");
                    assert!(elapsed < Duration::from_millis(200), "{strategy}");
                }

                let setup_thread = setup_thread.lock().unwrap().unwrap();
                if strategy.uses_threads() {
                    assert_ne!(setup_thread, thread::current().id(), "{strategy}");
                }
            }
        });
    }
}
