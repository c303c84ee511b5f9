#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing the store shootout harness.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use std::{env, fs, panic};

/// How long a test wrapped in [`with_watchdog()`] may run before it is declared hung.
///
/// Generous because some tests start worker processes, which is slow on loaded build agents.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs a test on a separate thread and fails it if it does not finish within
/// [`WATCHDOG_TIMEOUT`].
///
/// Barrier bugs show up as hangs rather than failures, so every test that waits on a barrier
/// should run under the watchdog.
///
/// Setting `MUTATION_TESTING=1` disables the watchdog, so mutation testing tools can observe
/// the hang themselves.
///
/// # Panics
///
/// Panics if the test times out. A panic in the test itself is resumed on the calling thread.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::Builder::new()
        .name("watched-test".to_string())
        .spawn(move || drop(tx.send(test_fn())))
        .expect("the test thread must start for the test to run at all");

    match rx.recv_timeout(WATCHDOG_TIMEOUT) {
        Ok(result) => {
            test_thread
                .join()
                .expect("the test thread already delivered its result");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {WATCHDOG_TIMEOUT:?}, assuming it hangs");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without delivering a result"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// The number of threads currently alive in this process.
///
/// Returns `None` on platforms where this cannot be determined.
#[must_use]
pub fn live_thread_count() -> Option<usize> {
    let status = fs::read_to_string("/proc/self/status").ok()?;

    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|count| count.trim().parse().ok())
}

/// Waits up to `patience` for the live thread count to drop to `baseline` or below.
///
/// Threads that have delivered their result may take a moment to actually exit, so tests that
/// check for leaked threads poll instead of sampling once. Returns the last observed count, or
/// `None` if thread counts are not available on this platform.
#[must_use]
pub fn settled_thread_count(baseline: usize, patience: Duration) -> Option<usize> {
    let started = Instant::now();

    loop {
        let count = live_thread_count()?;

        if count <= baseline || started.elapsed() >= patience {
            return Some(count);
        }

        thread::sleep(Duration::from_millis(10));
    }
}

/// The difference between the earliest and the latest of a set of timestamps.
///
/// Returns zero for an empty set.
#[must_use]
pub fn timestamp_spread(timestamps: &[Instant]) -> Duration {
    let earliest = timestamps.iter().min();
    let latest = timestamps.iter().max();

    match (earliest, latest) {
        (Some(earliest), Some(latest)) => latest.saturating_duration_since(*earliest),
        _ => Duration::ZERO,
    }
}
