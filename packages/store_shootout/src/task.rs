use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Error, Result, SyncPoint, WorkerIdentity};

/// The body of a worker: the code that every worker of a trial executes.
///
/// The task receives the identity of the worker executing it and a [`SyncPoint`] bound to that
/// worker, which it must call before every timed region so all workers cross the region
/// boundaries together.
///
/// The same task value is shared by reference between worker threads. Worker processes receive
/// a serialized copy instead, which requires the task to be a [`PortableTask`] and to say so
/// by returning an [`Envelope`] from [`envelope()`][Self::envelope].
pub trait Task: Send + Sync {
    /// The result produced by one worker. Serializable so it can cross a process boundary.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Executes the worker body.
    ///
    /// # Errors
    ///
    /// Any error returned here fails the whole trial.
    fn run(&self, identity: WorkerIdentity, sync: &SyncPoint) -> Result<Self::Output>;

    /// Packages the task for execution in a child process.
    ///
    /// Tasks that can only run in-process keep the default, which returns `None` and makes the
    /// multi-process strategy reject the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be serialized.
    fn envelope(&self) -> Result<Option<Envelope>> {
        Ok(None)
    }
}

/// A task that can be reconstructed in a child process from its serialized form.
///
/// The child process locates the task by [`NAME`][Self::NAME] in its
/// [`TaskRegistry`][crate::TaskRegistry], so the name must be unique among registered tasks.
pub trait PortableTask: Task + Serialize + DeserializeOwned + 'static {
    /// Unique name under which the task is registered in child processes.
    const NAME: &'static str;
}

/// A serialized task, ready to be sent to a child process.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub(crate) name: &'static str,
    pub(crate) payload: serde_json::Value,
}

impl Envelope {
    /// Serializes a portable task into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the task cannot be serialized.
    pub fn of<T: PortableTask>(task: &T) -> Result<Self> {
        let payload = serde_json::to_value(task).map_err(|e| {
            Error::Configuration(format!("task '{}' is not serializable: {e}", T::NAME))
        })?;

        Ok(Self {
            name: T::NAME,
            payload,
        })
    }

    /// The registry name of the enveloped task.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Adapts a closure into an in-process [`Task`].
///
/// Closures cannot cross a process boundary, so such a task can be executed by every strategy
/// except [`ExecutionStrategy::MultiProcess`][crate::ExecutionStrategy::MultiProcess].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use store_shootout::{ExecutionStrategy, Executor, WorkerIdentity, task_fn};
///
/// let executor = Executor::new(ExecutionStrategy::ThreadsPerWorkerResource);
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
#[derive(derive_more::Debug)]
pub struct FnTask<F> {
    #[debug(ignore)]
    f: F,
}

/// Creates a [`FnTask`] from a closure.
pub fn task_fn<F, R>(f: F) -> FnTask<F>
where
    F: Fn(WorkerIdentity, &SyncPoint) -> Result<R> + Send + Sync,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    FnTask { f }
}

impl<F, R> Task for FnTask<F>
where
    F: Fn(WorkerIdentity, &SyncPoint) -> Result<R> + Send + Sync,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    type Output = R;

    fn run(&self, identity: WorkerIdentity, sync: &SyncPoint) -> Result<R> {
        (self.f)(identity, sync)
    }
}
