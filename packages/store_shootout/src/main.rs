#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Command line entry point of the store shootout.
//!
//! Excluded from mutation testing: it only wires arguments into the library, and its behavior
//! is process entry and exit.

use std::env;
use std::io::{self, Write};
use std::num::NonZero;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use argh::FromArgs;
use store_shootout::{
    ChildProgram, Error, ExecutionStrategy, Report, Result, Runner, TrialConfiguration,
    load_contenders, speed_test_tasks,
};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

const LOG_ENV: &str = "SHOOTOUT_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

/// Measures the write and read latency of object stores under lock-step concurrency.
#[derive(FromArgs)]
struct Args {
    /// object count per transaction to measure; repeat to measure several (default 1000)
    #[argh(option)]
    object_counts: Vec<NonZero<usize>>,

    /// approximate size of each object in bytes (default 128)
    #[argh(option)]
    object_size: Option<usize>,

    /// concurrency level to measure; repeat to measure several (default 2)
    #[argh(option, short = 'c')]
    concurrency: Vec<NonZero<usize>>,

    /// run workers as threads instead of processes, sharing one store handle ("shared") or
    /// opening one each ("unique")
    #[argh(option)]
    threads: Option<ThreadMode>,

    /// run workers one after another on the main thread
    #[argh(switch)]
    sequential: bool,

    /// timed repetitions of each phase per worker (default 20)
    #[argh(option)]
    test_reps: Option<NonZero<usize>>,

    /// trials per contender, object count and concurrency level (default 1)
    #[argh(option)]
    repetitions: Option<NonZero<usize>>,

    /// attempts per trial before the run fails (default 1)
    #[argh(option)]
    attempts: Option<NonZero<usize>>,

    /// seed of the payload generators (default 0)
    #[argh(option)]
    seed: Option<u64>,

    /// seconds a worker may wait at a phase barrier (default 120)
    #[argh(option)]
    barrier_timeout_secs: Option<u64>,

    /// seconds the workers of one pool may take in total (default 3600)
    #[argh(option)]
    trial_timeout_secs: Option<u64>,

    /// log filter, such as "info" or "store_shootout=debug" (default from SHOOTOUT_LOG or
    /// RUST_LOG, else "warn")
    #[argh(option)]
    log: Option<String>,

    /// write every raw sample to this JSON file
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,

    /// TOML file listing the contenders
    #[argh(positional)]
    contenders: PathBuf,
}

#[derive(Clone, Copy, Debug)]
enum ThreadMode {
    Shared,
    Unique,
}

impl FromStr for ThreadMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "unique" => Ok(Self::Unique),
            other => Err(format!(
                "unknown thread mode '{other}', expected 'shared' or 'unique'"
            )),
        }
    }
}

#[cfg_attr(test, mutants::skip)]
fn main() -> ExitCode {
    // Worker processes get no command line, only the environment, and must serve their task
    // before the command line is parsed. Logging therefore starts from the environment and is
    // adjusted once the arguments are known.
    let log_filter = reload_handle_for(&env_filter());

    if let Some(exit_code) = speed_test_tasks().serve_if_worker() {
        return exit_code;
    }

    let args: Args = argh::from_env();

    let filter = args.log.clone().unwrap_or_else(env_filter);
    if args.log.is_some() && log_filter.reload(EnvFilter::new(&filter)).is_err() {
        eprintln!("Warning: the log filter could not be changed to '{filter}'");
    }

    match run(&args, &filter) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "benchmark failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn env_filter() -> String {
    env::var(LOG_ENV)
        .or_else(|_| env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
}

// Standard output carries the report (and, in worker processes, the protocol), so logs go to
// standard error.
fn reload_handle_for(filter: &str) -> reload::Handle<EnvFilter, Registry> {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();

    handle
}

fn run(args: &Args, log_filter: &str) -> Result<()> {
    let contenders = load_contenders(&args.contenders)?;
    let base = configuration(args)?;

    let runner = Runner::new(contenders, base)
        .with_object_counts(args.object_counts.clone())
        .with_concurrency_levels(args.concurrency.clone())
        .with_repetitions(args.repetitions.unwrap_or(NonZero::<usize>::MIN))
        .with_attempts(args.attempts.unwrap_or(NonZero::<usize>::MIN))
        .with_child_program(ChildProgram::current_exe().env(LOG_ENV, log_filter));

    let report = runner.run()?;

    print_report(&report)?;

    if let Some(path) = &args.output {
        report.write_json(path)?;
    }

    Ok(())
}

fn configuration(args: &Args) -> Result<TrialConfiguration> {
    let mut config = TrialConfiguration::default();

    config.strategy = match (args.sequential, args.threads) {
        (true, Some(_)) => {
            return Err(Error::Configuration(
                "--sequential and --threads cannot be combined".to_string(),
            ));
        }
        (true, None) => ExecutionStrategy::SingleProcessSequential,
        (false, Some(ThreadMode::Shared)) => ExecutionStrategy::ThreadsSharedResource,
        (false, Some(ThreadMode::Unique)) => ExecutionStrategy::ThreadsPerWorkerResource,
        (false, None) => ExecutionStrategy::MultiProcess,
    };

    if let Some(object_size) = args.object_size {
        config.object_size = object_size;
    }
    if let Some(test_reps) = args.test_reps {
        config.test_reps = test_reps;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(secs) = args.barrier_timeout_secs {
        config.barrier_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.trial_timeout_secs {
        config.trial_timeout = Duration::from_secs(secs);
    }

    Ok(config)
}

fn print_report(report: &Report) -> Result<()> {
    let mut stdout = io::stdout().lock();

    report
        .write_table(&mut stdout)
        .and_then(|()| stdout.flush())
        .map_err(|e| Error::output("cannot print report", e))
}
