#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Measures the write and read latency of persistent object stores under lock-step concurrency.
//!
//! A benchmark trial runs a pool of workers, each owning one partition of the dataset, through a
//! fixed sequence of phases: add objects, update them, then read them back with warm, cold, hot
//! and fully populated caches. Before every timed phase all workers cross a barrier together, so
//! each phase measures the store under exactly the intended concurrency.
//!
//! The core of the package is the trial orchestrator:
//!
//! - [`Executor::distribute()`] runs one worker per [`WorkerIdentity`] according to an
//!   [`ExecutionStrategy`] (worker processes, worker threads with a shared or a private store
//!   handle, or sequentially on the calling thread) and returns their results in identity order.
//! - [`Executor::run_isolated()`] runs one-time setup in a throwaway worker context so its side
//!   effects (such as warmed caches) do not leak into the measured workers.
//! - [`SyncPoint`] is the callable every worker uses to wait for its peers at phase boundaries,
//!   backed by a parent-hosted [`Barrier`].
//!
//! On top of the orchestrator, [`SpeedTest`] implements the phased benchmark against a
//! [`Store`], and [`Runner`] runs every combination of contenders, object counts and
//! concurrency levels into a [`Report`].
//!
//! # Worker processes
//!
//! The default strategy, [`ExecutionStrategy::MultiProcess`], re-executes the current program
//! once per worker. Such a program must call [`TaskRegistry::serve_if_worker()`] at the start of
//! `main()`:
//!
//! ```no_run
//! use std::process::ExitCode;
//!
//! fn main() -> ExitCode {
//!     if let Some(exit_code) = store_shootout::speed_test_tasks().serve_if_worker() {
//!         return exit_code;
//!     }
//!
//!     // Run benchmarks here.
//!     ExitCode::SUCCESS
//! }
//! ```
//!
//! # Failures
//!
//! Every failure of any worker fails the whole trial with an [`Error`]; partial results are
//! never returned. Waits are bounded, so a hung worker becomes [`Error::WorkerTimeout`] instead
//! of a hung benchmark.

mod barrier;
mod config;
mod driver;
mod error;
mod executor;
mod identity;
mod payload;
mod process;
mod report;
mod runner;
mod store;
mod strategy;
mod sync_point;
mod task;
mod worker;

pub use barrier::*;
pub use config::*;
pub use driver::*;
pub use error::*;
pub use executor::*;
pub use identity::*;
pub use payload::*;
pub use process::{ChildProgram, TaskRegistry};
pub use report::*;
pub use runner::*;
pub use store::{Connection, Store, StoredObject};
pub use strategy::*;
pub use sync_point::*;
pub use task::*;
pub use worker::WorkerHandle;
