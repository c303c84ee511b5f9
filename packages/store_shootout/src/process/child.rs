// Child side of a worker process.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::{env, fmt};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::process::protocol::{self, ToChild, ToParent, WORKER_ENV};
use crate::worker::run_guarded;
use crate::{Error, PortableTask, Result, SyncPoint, Task, WorkerIdentity};

type Runner =
    Box<dyn Fn(serde_json::Value, WorkerIdentity, &SyncPoint) -> Result<serde_json::Value> + Send + Sync>;

/// The tasks a worker process knows how to execute.
///
/// A program that uses [`ExecutionStrategy::MultiProcess`][crate::ExecutionStrategy::MultiProcess]
/// is re-executed to create each worker process. The re-executed program must recognize that it
/// was started as a worker and serve the task it is given instead of doing whatever it normally
/// does. This is done by calling [`serve_if_worker()`][Self::serve_if_worker] first thing in
/// `main()`, with every portable task the program may distribute registered.
///
/// # Examples
///
/// ```no_run
/// use std::process::ExitCode;
///
/// use store_shootout::{PopulateTask, ReadTask, TaskRegistry, WriteTask};
///
/// fn main() -> ExitCode {
///     let registry = TaskRegistry::new()
///         .register::<PopulateTask>()
///         .register::<WriteTask>()
///         .register::<ReadTask>();
///
///     if let Some(exit_code) = registry.serve_if_worker() {
///         return exit_code;
///     }
///
///     // Regular program logic goes here.
///     ExitCode::SUCCESS
/// }
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    runners: HashMap<&'static str, Runner>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task type under its [`PortableTask::NAME`].
    ///
    /// # Panics
    ///
    /// Panics if another task with the same name is already registered.
    #[must_use]
    pub fn register<T: PortableTask>(mut self) -> Self {
        let runner: Runner = Box::new(
            |payload: serde_json::Value, identity: WorkerIdentity, sync: &SyncPoint| {
                let task: T = serde_json::from_value(payload).map_err(|e| {
                    Error::Configuration(format!("cannot decode task '{}': {e}", T::NAME))
                })?;

                let output = task.run(identity, sync)?;

                serde_json::to_value(output).map_err(|e| Error::WorkerCrash {
                    identity,
                    detail: format!("cannot encode result of task '{}': {e}", T::NAME),
                })
            },
        );

        let previous = self.runners.insert(T::NAME, runner);
        assert!(previous.is_none(), "task name '{}' registered twice", T::NAME);

        self
    }

    /// If the current process was started as a worker process, serves the task sent by the
    /// parent over stdin/stdout and returns the exit code the process should exit with.
    ///
    /// Returns `None` if the current process is not a worker process.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Only reachable in re-executed worker processes.
    pub fn serve_if_worker(&self) -> Option<ExitCode> {
        env::var_os(WORKER_ENV)?;

        Some(match self.serve(BufReader::new(io::stdin()), io::stdout()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "worker process lost contact with its parent");
                ExitCode::FAILURE
            }
        })
    }

    pub(crate) fn serve<R, W>(&self, mut reader: R, writer: W) -> io::Result<()>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let Some(ToChild::Start {
            task,
            identity,
            payload,
        }) = protocol::receive(&mut reader, |_| {})?
        else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected the task as the first message",
            ));
        };

        debug!(%identity, task = %task, "worker process serving task");

        let link = ParentLink {
            channel: Arc::new(Mutex::new(Channel {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })),
        };
        let channel = Arc::clone(&link.channel);

        let result = match self.runners.get(task.as_str()) {
            Some(runner) => {
                let sync = SyncPoint::remote(identity, link);
                run_guarded(&RegisteredTask { runner, payload }, identity, &sync)
            }
            None => Err(Error::Configuration(format!(
                "task '{task}' is not registered in the worker process"
            ))),
        };

        let mut channel = channel.lock();
        protocol::send(&mut channel.writer, &ToParent::Finished(result))
    }
}

// Lets a registered runner be executed through the same panic guard as any other task.
struct RegisteredTask<'a> {
    runner: &'a Runner,
    payload: serde_json::Value,
}

impl Task for RegisteredTask<'_> {
    type Output = serde_json::Value;

    fn run(&self, identity: WorkerIdentity, sync: &SyncPoint) -> Result<serde_json::Value> {
        (self.runner)(self.payload.clone(), identity, sync)
    }
}

struct Channel {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
}

/// The connection from a worker process to the barrier hosted by its parent process.
#[derive(derive_more::Debug)]
pub(crate) struct ParentLink {
    #[debug(ignore)]
    channel: Arc<Mutex<Channel>>,
}

impl ParentLink {
    pub(crate) fn arrive_and_wait(&self, identity: WorkerIdentity) -> Result<()> {
        let lost = |detail: String| Error::WorkerCrash { identity, detail };

        let mut channel = self.channel.lock();

        protocol::send(&mut channel.writer, &ToParent::Arrive)
            .map_err(|e| lost(format!("cannot reach parent process: {e}")))?;

        match protocol::receive(&mut channel.reader, |_| {}) {
            Ok(Some(ToChild::Release)) => Ok(()),
            Ok(Some(ToChild::Abort(error))) => Err(error),
            Ok(Some(ToChild::Start { .. })) => Err(lost(
                "parent process sent a second task while the first was running".to_string(),
            )),
            Ok(None) => Err(lost("parent process closed the channel".to_string())),
            Err(e) => Err(lost(format!("cannot read from parent process: {e}"))),
        }
    }
}
