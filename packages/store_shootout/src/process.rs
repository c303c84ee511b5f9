//! Worker processes.
//!
//! The multi-process strategy re-executes a program (by default the current executable) once
//! per worker. Parent and child talk over the child's stdin and stdout; the child's stderr is
//! inherited so its log output shows up next to the parent's.

mod child;
mod parent;
mod protocol;

use std::env;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Command;

pub use child::TaskRegistry;
pub(crate) use child::ParentLink;
pub(crate) use parent::ProcessWorker;

/// The program started to create a worker process.
///
/// The program must call [`TaskRegistry::serve_if_worker()`] before doing anything else, with
/// every task it will be asked to run registered.
///
/// # Examples
///
/// ```
/// use store_shootout::ChildProgram;
///
/// // Re-execute ourselves, passing the log filter along.
/// let program = ChildProgram::current_exe().env("SHOOTOUT_LOG", "debug");
/// ```
#[derive(Clone, Debug, Default)]
pub struct ChildProgram {
    /// `None` means the current executable, resolved when the worker is started.
    program: Option<PathBuf>,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ChildProgram {
    /// Re-executes the current executable.
    #[must_use]
    pub fn current_exe() -> Self {
        Self::default()
    }

    /// Executes the program at the given path.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    /// Adds a command line argument for the worker process.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for the worker process.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub(crate) fn command(&self) -> io::Result<Command> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => env::current_exe()?,
        };

        let mut command = Command::new(program);
        command.args(&self.args);
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));

        Ok(command)
    }
}
