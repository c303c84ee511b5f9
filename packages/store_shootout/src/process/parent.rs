// Parent side of a worker process.
//
// Every worker process gets a relay thread in the parent. The relay feeds the serialized task to
// the child, turns the child's barrier arrivals into arrivals at the parent-hosted barrier and
// sends back the release, and finally collects the child's result together with its exit
// status. The relay always departs the barrier when the child is gone, so a crashed child never
// holds its siblings up.

use std::io::{self, BufReader};
use std::marker::PhantomData;
use std::process::{Child, ChildStdin, ChildStdout, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::process::ChildProgram;
use crate::process::protocol::{self, ToChild, ToParent, WORKER_ENV};
use crate::{Barrier, Envelope, Error, Result, WorkerIdentity};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A running worker process, as seen from the parent.
#[derive(derive_more::Debug)]
pub(crate) struct ProcessWorker<R> {
    identity: WorkerIdentity,
    started: Instant,

    #[debug(ignore)]
    child: Arc<Mutex<Child>>,
    #[debug(ignore)]
    relay: JoinHandle<()>,
    #[debug(ignore)]
    result_rx: oneshot::Receiver<Result<serde_json::Value>>,

    barrier: Arc<Barrier>,

    _output: PhantomData<fn() -> R>,
}

impl<R> ProcessWorker<R>
where
    R: DeserializeOwned,
{
    pub(crate) fn spawn(
        program: &ChildProgram,
        envelope: &Envelope,
        identity: WorkerIdentity,
        barrier: &Arc<Barrier>,
    ) -> Result<Self> {
        let crashed = |detail: String| Error::WorkerCrash { identity, detail };

        let mut command = program
            .command()
            .map_err(|e| crashed(format!("cannot locate worker program: {e}")))?;

        command
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|e| crashed(format!("failed to start worker process: {e}")))?;

        let to_child = child
            .stdin
            .take()
            .expect("stdin was configured as piped above");
        let from_child = child
            .stdout
            .take()
            .expect("stdout was configured as piped above");

        debug!(%identity, pid = child.id(), task = envelope.name(), "worker process started");

        let child = Arc::new(Mutex::new(child));
        let (result_tx, result_rx) = oneshot::channel();

        let start = ToChild::Start {
            task: envelope.name().to_string(),
            identity,
            payload: envelope.payload.clone(),
        };

        let relay = thread::Builder::new()
            .name(format!("shootout-relay-{identity}"))
            .spawn({
                let child = Arc::clone(&child);
                let barrier = Arc::clone(barrier);

                move || {
                    let result = relay(
                        identity,
                        &start,
                        to_child,
                        BufReader::new(from_child),
                        &barrier,
                        &child,
                    );

                    // Whatever happened, this worker will never arrive at the barrier again.
                    barrier.depart();

                    drop(result_tx.send(result));
                }
            });

        let relay = match relay {
            Ok(relay) => relay,
            Err(e) => {
                kill(&child, identity);
                return Err(crashed(format!("failed to start relay thread: {e}")));
            }
        };

        Ok(Self {
            identity,
            started: Instant::now(),
            child,
            relay,
            result_rx,
            barrier: Arc::clone(barrier),
            _output: PhantomData,
        })
    }

    pub(crate) fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    pub(crate) fn join(self, deadline: Instant) -> Result<R> {
        let remaining = deadline.saturating_duration_since(Instant::now());

        let outcome = match self.result_rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(oneshot::RecvTimeoutError::Timeout) => {
                warn!(identity = %self.identity, "worker process did not finish in time, killing it");

                // Siblings blocked on the barrier would otherwise wait for this worker forever.
                self.barrier.break_barrier();
                kill(&self.child, self.identity);

                Err(Error::WorkerTimeout {
                    identity: self.identity,
                    waited: self.started.elapsed(),
                })
            }
            Err(oneshot::RecvTimeoutError::Disconnected) => Err(Error::WorkerCrash {
                identity: self.identity,
                detail: "relay thread terminated without a result".to_string(),
            }),
        };

        drop(self.result_rx);

        // The relay exits once the child is gone, which is now guaranteed either way.
        if self.relay.join().is_err() {
            warn!(identity = %self.identity, "relay thread panicked");
        }

        let value = outcome?;

        serde_json::from_value(value).map_err(|e| Error::WorkerCrash {
            identity: self.identity,
            detail: format!("worker process reported an unreadable result: {e}"),
        })
    }
}

fn relay(
    identity: WorkerIdentity,
    start: &ToChild,
    mut to_child: ChildStdin,
    mut from_child: BufReader<ChildStdout>,
    barrier: &Barrier,
    child: &Mutex<Child>,
) -> Result<serde_json::Value> {
    let mut outcome = None;

    if let Err(e) = protocol::send(&mut to_child, start) {
        warn!(%identity, error = %e, "could not send task to worker process");
    } else {
        loop {
            let message = protocol::receive(&mut from_child, |line| {
                eprintln!("[worker {identity}] {line}");
            });

            match message {
                Ok(Some(ToParent::Arrive)) => {
                    let reply = match barrier.arrive_and_wait(identity) {
                        Ok(()) => ToChild::Release,
                        Err(e) => ToChild::Abort(e),
                    };

                    if let Err(e) = protocol::send(&mut to_child, &reply) {
                        debug!(%identity, error = %e, "worker process stopped listening");
                        break;
                    }
                }
                Ok(Some(ToParent::Finished(result))) => outcome = Some(result),
                Ok(None) => break,
                Err(e) => {
                    warn!(%identity, error = %e, "unreadable message from worker process");
                    break;
                }
            }
        }
    }

    // Closing stdin lets a child that is still waiting for us notice that we are gone.
    drop(to_child);

    let status = wait_for_exit(child).map_err(|e| Error::WorkerCrash {
        identity,
        detail: format!("cannot observe worker process exit: {e}"),
    })?;

    debug!(%identity, %status, "worker process exited");

    match outcome {
        Some(Ok(value)) if status.success() => Ok(value),
        Some(Err(error)) => Err(error),
        Some(Ok(_)) | None => Err(Error::WorkerCrash {
            identity,
            detail: format!("worker process ended with {status} before completing"),
        }),
    }
}

// Polls instead of blocking in `wait()` so that the lock is not held while the child runs,
// leaving it available to `kill()` from the joining thread.
#[cfg_attr(test, mutants::skip)] // Removing the sleep only burns processor time.
fn wait_for_exit(child: &Mutex<Child>) -> io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.lock().try_wait()? {
            return Ok(status);
        }

        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn kill(child: &Mutex<Child>, identity: WorkerIdentity) {
    if let Err(e) = child.lock().kill() {
        // Typically means it already exited, which is what we wanted anyway.
        debug!(%identity, error = %e, "could not kill worker process");
    }
}
