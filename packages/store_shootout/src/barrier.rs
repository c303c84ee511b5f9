use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::{Error, Result, WorkerIdentity};

/// A reusable rendezvous point for the workers of one trial.
///
/// Every participant calls [`arrive_and_wait()`][Self::arrive_and_wait] at every phase boundary.
/// The call blocks until all expected participants have arrived, at which point all of them are
/// released together and the barrier advances to the next generation, ready for the next phase.
///
/// # Liveness
///
/// Every wait is bounded by the timeout given at construction. If the participants do not all
/// arrive in time, the waiting participant receives [`Error::WorkerTimeout`] and the barrier
/// becomes broken: every participant currently waiting, and every later arrival, fails
/// immediately instead of hanging. A timeout too large to be represented as an [`Instant`]
/// never expires.
///
/// A participant that stops taking part (because it finished or crashed) calls
/// [`depart()`][Self::depart]. Its slot then counts as satisfied in the current and every
/// later generation, so the remaining participants are not held up by it.
///
/// # Single participant
///
/// A barrier for exactly one participant never blocks.
#[derive(Debug)]
pub struct Barrier {
    state: Mutex<State>,
    released: Condvar,

    single_participant: bool,
    timeout: Duration,
}

#[derive(Debug)]
struct State {
    /// How many arrivals release the current generation. Shrinks as participants depart.
    participants: usize,
    arrived: usize,
    generation: u64,
    broken: bool,
}

impl Barrier {
    /// Creates a barrier for `participants` participants, bounding every wait by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `participants` is zero.
    pub fn new(participants: usize, timeout: Duration) -> Result<Self> {
        if participants == 0 {
            return Err(Error::Configuration(
                "a barrier requires at least one participant".to_string(),
            ));
        }

        Ok(Self {
            state: Mutex::new(State {
                participants,
                arrived: 0,
                generation: 0,
                broken: false,
            }),
            released: Condvar::new(),
            single_participant: participants == 1,
            timeout,
        })
    }

    /// Blocks the calling participant until every participant of the current generation has
    /// arrived, then releases all of them together.
    ///
    /// `identity` is only used to attribute a timeout to the participant that observed it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerTimeout`] if the other participants did not arrive within the
    /// timeout or if the barrier was already broken by an earlier timeout.
    pub fn arrive_and_wait(&self, identity: WorkerIdentity) -> Result<()> {
        if self.single_participant {
            return Ok(());
        }

        let started = Instant::now();
        // A timeout too large to represent as an instant never expires.
        let deadline = started.checked_add(self.timeout);

        let mut state = self.state.lock();

        if state.broken {
            return Err(Error::WorkerTimeout {
                identity,
                waited: started.elapsed(),
            });
        }

        state.arrived = state
            .arrived
            .checked_add(1)
            .expect("arrivals are bounded by the participant count");

        if state.arrived >= state.participants {
            trace!(%identity, generation = state.generation, "last arrival releases barrier");
            release(&mut state);
            self.released.notify_all();
            return Ok(());
        }

        let generation = state.generation;

        loop {
            let timed_out = match deadline {
                Some(deadline) => self.released.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.released.wait(&mut state);
                    false
                }
            };

            if state.generation != generation {
                return Ok(());
            }

            if state.broken {
                return Err(Error::WorkerTimeout {
                    identity,
                    waited: started.elapsed(),
                });
            }

            if timed_out {
                warn!(
                    %identity,
                    generation,
                    arrived = state.arrived,
                    participants = state.participants,
                    "barrier wait timed out, breaking barrier"
                );

                state.broken = true;
                self.released.notify_all();

                return Err(Error::WorkerTimeout {
                    identity,
                    waited: started.elapsed(),
                });
            }

            // Spurious wakeup, keep waiting.
        }
    }

    /// Removes one participant from the barrier.
    ///
    /// If the remaining participants have all already arrived in the current generation, they
    /// are released immediately.
    pub fn depart(&self) {
        let mut state = self.state.lock();

        state.participants = state.participants.saturating_sub(1);

        if state.arrived > 0 && state.arrived >= state.participants {
            trace!(
                generation = state.generation,
                "departure releases waiting participants"
            );
            release(&mut state);
            self.released.notify_all();
        }
    }

    /// Breaks the barrier, failing every current and future wait.
    ///
    /// Used when the orchestrator has given up on a trial and wants every worker still blocked
    /// on the barrier to bail out.
    pub fn break_barrier(&self) {
        let mut state = self.state.lock();
        state.broken = true;
        self.released.notify_all();
    }

    /// Whether a timeout or an explicit [`break_barrier()`][Self::break_barrier] has broken the
    /// barrier.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }
}

fn release(state: &mut State) {
    state.arrived = 0;
    state.generation = state.generation.wrapping_add(1);
}
