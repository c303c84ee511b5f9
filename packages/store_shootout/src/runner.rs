use std::num::NonZero;

use new_zealand::nz;
use tracing::{info, info_span, warn};

use crate::{
    ChildProgram, Contender, Report, ReportEntry, Result, SpeedTest, TrialConfiguration,
    TrialTimes,
};

/// Runs every combination of contender, object count and concurrency level, each for a number
/// of repetitions, and collects the results into a [`Report`].
///
/// A failed trial is rerun from scratch up to the configured number of attempts. A trial that
/// fails every attempt fails the whole run; no data is ever substituted for it.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use store_shootout::{
///     Contender, ExecutionStrategy, Runner, StoreConfig, TrialConfiguration,
/// };
///
/// let mut base = TrialConfiguration::default();
/// base.strategy = ExecutionStrategy::ThreadsSharedResource;
/// base.test_reps = nz!(1);
///
/// let report = Runner::new(
///     vec![Contender::new("ram", StoreConfig::memory("runner-example"))],
///     base,
/// )
/// .with_object_counts(vec![nz!(10), nz!(100)])
/// .run()
/// .unwrap();
///
/// assert_eq!(report.entries.len(), 2);
/// ```
#[derive(Debug)]
pub struct Runner {
    contenders: Vec<Contender>,
    base: TrialConfiguration,

    object_counts: Vec<NonZero<usize>>,
    concurrency_levels: Vec<NonZero<usize>>,
    repetitions: NonZero<usize>,
    attempts: NonZero<usize>,

    child_program: ChildProgram,
}

impl Runner {
    /// Creates a runner for the given contenders. Unless overridden, every contender is measured
    /// once with the object count and concurrency of `base`.
    #[must_use]
    pub fn new(contenders: Vec<Contender>, base: TrialConfiguration) -> Self {
        Self {
            contenders,
            object_counts: vec![base.objects_per_txn],
            concurrency_levels: vec![base.concurrency],
            base,
            repetitions: nz!(1),
            attempts: nz!(1),
            child_program: ChildProgram::current_exe(),
        }
    }

    /// Sets the object counts to measure. An empty list keeps the current ones.
    #[must_use]
    pub fn with_object_counts(mut self, counts: Vec<NonZero<usize>>) -> Self {
        if !counts.is_empty() {
            self.object_counts = counts;
        }
        self
    }

    /// Sets the concurrency levels to measure. An empty list keeps the current ones.
    #[must_use]
    pub fn with_concurrency_levels(mut self, levels: Vec<NonZero<usize>>) -> Self {
        if !levels.is_empty() {
            self.concurrency_levels = levels;
        }
        self
    }

    /// Sets how many trials are run for every combination.
    #[must_use]
    pub fn with_repetitions(mut self, repetitions: NonZero<usize>) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Sets how many times a trial is attempted before the run fails.
    #[must_use]
    pub fn with_attempts(mut self, attempts: NonZero<usize>) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the program started for worker processes.
    #[must_use]
    pub fn with_child_program(mut self, child_program: ChildProgram) -> Self {
        self.child_program = child_program;
        self
    }

    /// Runs every trial.
    ///
    /// Every combination is checked before the first trial starts, so a configuration error
    /// does not surface halfway through a long run.
    ///
    /// # Errors
    ///
    /// Returns the error of the first trial that failed every attempt, or a configuration
    /// error if some combination cannot be run.
    pub fn run(&self) -> Result<Report> {
        let tests = self.speed_tests()?;
        let mut report = Report::default();

        for (contender, test) in tests {
            let config = test.config();
            let mut entry = ReportEntry::new(
                &contender.name,
                config.objects_per_txn.get(),
                config.concurrency.get(),
                config.strategy,
            );

            let _span = info_span!(
                "contender",
                name = %contender.name,
                objects = config.objects_per_txn.get(),
                concurrency = config.concurrency.get()
            )
            .entered();

            for rep in 0..self.repetitions.get() {
                let rep = rep as u64;
                entry.trials.push(self.run_with_retries(rep, || test.run(rep))?);
            }

            report.entries.push(entry);
        }

        Ok(report)
    }

    fn speed_tests(&self) -> Result<Vec<(&Contender, SpeedTest)>> {
        let mut tests = Vec::new();

        for contender in &self.contenders {
            for objects_per_txn in &self.object_counts {
                for concurrency in &self.concurrency_levels {
                    let mut config = self.base.clone();
                    config.objects_per_txn = *objects_per_txn;
                    config.concurrency = *concurrency;

                    let test = SpeedTest::new(config, contender.store.clone())?
                        .with_child_program(self.child_program.clone());

                    tests.push((contender, test));
                }
            }
        }

        Ok(tests)
    }

    // Every attempt reruns the whole trial, populate phase included.
    fn run_with_retries<F>(&self, rep: u64, mut trial: F) -> Result<TrialTimes>
    where
        F: FnMut() -> Result<TrialTimes>,
    {
        let attempts = self.attempts.get();
        let mut attempt = 1;

        loop {
            match trial() {
                Ok(times) => {
                    info!(rep, attempt, "trial succeeded");
                    return Ok(times);
                }
                Err(e) if attempt < attempts => {
                    warn!(rep, attempt, attempts, error = %e, "trial failed, retrying");
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
