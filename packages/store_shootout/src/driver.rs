//! The phased speed test.
//!
//! One trial walks through the phases of [`Phase`] in order. The populate phase runs once in an
//! isolated worker, then a pool of workers runs the write phases and a second pool runs the read
//! phases. Every timed phase starts with all workers of the pool crossing a barrier together.

mod tasks;

use std::num::NonZero;
use std::sync::Arc;

use tracing::{debug, info, info_span};

use crate::{
    ChildProgram, Executor, Result, StoreConfig, TaskRegistry, TrialConfiguration, TrialTimes,
    WorkerIdentity,
};

pub use tasks::{PopulateTask, ReadTask, WriteTask};

/// The phases of one trial, in the order they run.
#[derive(Clone, Copy, Debug, derive_more::Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum Phase {
    /// The store is wiped and one empty partition per worker is created. Not timed.
    #[display("populate")]
    Populate,

    /// Every worker adds its objects to its partition.
    #[display("add")]
    WriteAdd,

    /// Every worker modifies every object of its partition.
    #[display("update")]
    WriteUpdate,

    /// Every worker reads its partition right after the write phases.
    #[display("warm")]
    ReadWarm,

    /// Every worker reads its partition after all caches were cleared.
    #[display("cold")]
    ReadCold,

    /// Every worker reads its partition with only the connection cache minimized.
    #[display("hot")]
    ReadHot,

    /// Every worker reads its partition with all caches in place.
    #[display("steamin")]
    ReadSteamIn,

    /// The results have been collected.
    #[display("done")]
    Done,
}

impl Phase {
    /// The phase that follows this one, or `None` after [`Phase::Done`].
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Populate => Some(Self::WriteAdd),
            Self::WriteAdd => Some(Self::WriteUpdate),
            Self::WriteUpdate => Some(Self::ReadWarm),
            Self::ReadWarm => Some(Self::ReadCold),
            Self::ReadCold => Some(Self::ReadHot),
            Self::ReadHot => Some(Self::ReadSteamIn),
            Self::ReadSteamIn => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// Whether workers measure this phase.
    #[must_use]
    pub fn is_timed(self) -> bool {
        !matches!(self, Self::Populate | Self::Done)
    }
}

/// A task registry with every task a speed test distributes to worker processes.
///
/// A program running speed tests with [`ExecutionStrategy::MultiProcess`] must serve these
/// tasks when re-executed as a worker; see [`TaskRegistry::serve_if_worker()`].
///
/// [`ExecutionStrategy::MultiProcess`]: crate::ExecutionStrategy::MultiProcess
#[must_use]
pub fn speed_test_tasks() -> TaskRegistry {
    TaskRegistry::new()
        .register::<PopulateTask>()
        .register::<WriteTask>()
        .register::<ReadTask>()
}

/// Runs trials of one configuration against one store.
///
/// # Examples
///
/// ```
/// use store_shootout::{ExecutionStrategy, SpeedTest, StoreConfig, TrialConfiguration};
/// use new_zealand::nz;
///
/// let mut config = TrialConfiguration::default();
/// config.strategy = ExecutionStrategy::ThreadsPerWorkerResource;
/// config.objects_per_txn = nz!(50);
/// config.test_reps = nz!(2);
///
/// let trial = SpeedTest::new(config, StoreConfig::memory("doc-example"))
///     .unwrap()
///     .run(0)
///     .unwrap();
///
/// // Two workers with two repetitions each.
/// assert_eq!(trial.samples.len(), 4);
/// ```
#[derive(Debug)]
pub struct SpeedTest {
    config: TrialConfiguration,
    store: StoreConfig,
    executor: Executor,
}

impl SpeedTest {
    /// Prepares trials of `config` against `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`][crate::Error::Configuration] if the configuration
    /// cannot be used with the store.
    pub fn new(config: TrialConfiguration, store: StoreConfig) -> Result<Self> {
        config.validate_for(&store)?;

        let executor = Executor::new(config.strategy)
            .with_barrier_timeout(config.barrier_timeout)
            .with_trial_timeout(config.trial_timeout);

        Ok(Self {
            config,
            store,
            executor,
        })
    }

    /// Sets the program started for worker processes.
    #[must_use]
    pub fn with_child_program(mut self, child_program: ChildProgram) -> Self {
        self.executor = self.executor.with_child_program(child_program);
        self
    }

    /// The configuration of the trials.
    #[must_use]
    pub fn config(&self) -> &TrialConfiguration {
        &self.config
    }

    /// Runs one trial. `rep` is the number of the trial among repetitions of the same
    /// configuration and only influences the payloads that are written.
    ///
    /// # Errors
    ///
    /// Returns the first error of any worker. A failed trial produces no results.
    pub fn run(&self, rep: u64) -> Result<TrialTimes> {
        let concurrency = self.config.concurrency;

        let _span = info_span!(
            "trial",
            strategy = %self.config.strategy,
            concurrency = concurrency.get(),
            objects = self.config.objects_per_txn.get(),
            rep
        )
        .entered();

        // One handle for the whole trial when the workers share it; otherwise every worker
        // opens its own.
        let shared = if self.config.strategy.shares_store_handle() {
            Some(Arc::new(self.store.open()?))
        } else {
            None
        };

        debug!(phase = %Phase::Populate, "running isolated setup");
        self.executor.run_isolated(PopulateTask::new(
            self.store.clone(),
            concurrency,
            shared.clone(),
        ))?;

        let identities = identities(concurrency);

        let write = self.executor.distribute(
            WriteTask::new(self.config.clone(), self.store.clone(), rep, shared.clone()),
            &identities,
        )?;

        let read = self.executor.distribute(
            ReadTask::new(self.config.clone(), self.store.clone(), shared),
            &identities,
        )?;

        let trial = TrialTimes::from_samples(
            &write.into_iter().flatten().collect::<Vec<_>>(),
            &read.into_iter().flatten().collect::<Vec<_>>(),
        )?;

        info!(
            phase = %Phase::Done,
            add = ?trial.write_means.add,
            update = ?trial.write_means.update,
            warm = ?trial.read_means.warm,
            cold = ?trial.read_means.cold,
            hot = ?trial.read_means.hot,
            steamin = ?trial.read_means.steamin,
            "trial finished"
        );

        Ok(trial)
    }
}

fn identities(concurrency: NonZero<usize>) -> Vec<WorkerIdentity> {
    WorkerIdentity::range(concurrency.get()).collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use testing::with_watchdog;

    use super::*;
    use crate::{Error, ExecutionStrategy};

    #[test]
    fn phases_run_in_order() {
        let mut phases = vec![Phase::Populate];
        while let Some(next) = phases.last().and_then(|phase| phase.next()) {
            phases.push(next);
        }

        assert_eq!(
            phases,
            vec![
                Phase::Populate,
                Phase::WriteAdd,
                Phase::WriteUpdate,
                Phase::ReadWarm,
                Phase::ReadCold,
                Phase::ReadHot,
                Phase::ReadSteamIn,
                Phase::Done,
            ]
        );

        // Ordering of the enum matches the order the phases run in.
        assert!(phases.is_sorted());
    }

    #[test]
    fn only_measured_phases_are_timed() {
        assert!(!Phase::Populate.is_timed());
        assert!(Phase::ReadCold.is_timed());
        assert!(!Phase::Done.is_timed());
    }

    fn small_config(strategy: ExecutionStrategy) -> TrialConfiguration {
        let mut config = TrialConfiguration::default();
        config.strategy = strategy;
        config.concurrency = nz!(3);
        config.objects_per_txn = nz!(20);
        config.object_size = 16;
        config.test_reps = nz!(2);
        config
    }

    #[test]
    fn in_process_strategies_complete_a_trial() {
        with_watchdog(|| {
            for strategy in [
                ExecutionStrategy::SingleProcessSequential,
                ExecutionStrategy::ThreadsSharedResource,
                ExecutionStrategy::ThreadsPerWorkerResource,
            ] {
                let store = StoreConfig::memory(format!("driver-trial-{strategy}"));

                let trial = SpeedTest::new(small_config(strategy), store)
                    .unwrap()
                    .run(0)
                    .unwrap();

                // Three workers, two repetitions each.
                assert_eq!(trial.samples.len(), 6, "{strategy}");

                // The warm read is measured once per worker and repeated in each sample.
                for worker in trial.samples.chunks(2) {
                    let first = worker.first().unwrap();
                    assert!(worker.iter().all(|s| s.read.warm == first.read.warm));
                }
            }
        });
    }

    #[test]
    fn directory_store_completes_a_trial() {
        with_watchdog(|| {
            let dir = tempfile::tempdir().unwrap();

            let trial = SpeedTest::new(
                small_config(ExecutionStrategy::ThreadsPerWorkerResource),
                StoreConfig::directory(dir.path()),
            )
            .unwrap()
            .run(1)
            .unwrap();

            assert_eq!(trial.samples.len(), 6);
        });
    }

    #[test]
    fn memory_store_with_processes_is_rejected_up_front() {
        let result = SpeedTest::new(
            small_config(ExecutionStrategy::MultiProcess),
            StoreConfig::memory("driver-rejected"),
        );

        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn registry_knows_every_task() {
        let registry = format!("{:?}", speed_test_tasks());

        for name in ["populate", "write", "read"] {
            assert!(registry.contains(name), "{registry}");
        }
    }
}
