// The worker bodies of a speed test.
//
// Each task carries everything a worker needs to do its part, so the same value runs on a worker
// thread or, serialized, in a worker process. The shared store handle is the exception: it only
// exists under the shared-handle strategy, which never crosses a process boundary.

use std::num::NonZero;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span};

use crate::driver::Phase;
use crate::{
    Connection, Envelope, Error, PayloadGenerator, PortableTask, ReadTimes, Result, Store,
    StoreConfig, SyncPoint, Task, TrialConfiguration, WorkerIdentity, WriteTimes,
};

// Lets the store settle background work of the write phases before the handle is closed.
const SETTLE_BEFORE_CLOSE: Duration = Duration::from_millis(100);

fn open_store(config: &StoreConfig, shared: Option<&Arc<Store>>) -> Result<Arc<Store>> {
    match shared {
        Some(store) => Ok(Arc::clone(store)),
        None => config.open().map(Arc::new),
    }
}

// Opening the connection is part of every measurement because that is where a store catches
// up with changes made by others. Closing it is not.
fn time_transaction<'s, F>(store: &'s Store, body: F) -> Result<Duration>
where
    F: FnOnce(&mut Connection<'s>) -> Result<()>,
{
    let start = Instant::now();

    let mut connection = store.connect();
    body(&mut connection)?;

    let elapsed = start.elapsed();
    drop(connection);

    Ok(elapsed)
}

fn cross_into(phase: Phase, identity: WorkerIdentity, sync: &SyncPoint) -> Result<()> {
    debug!(%identity, %phase, "waiting to enter phase");
    sync.wait()
}

/// Wipes the store and creates one empty partition per worker.
#[derive(Debug, Deserialize, Serialize)]
pub struct PopulateTask {
    store: StoreConfig,
    partitions: NonZero<usize>,

    #[serde(skip)]
    shared: Option<Arc<Store>>,
}

impl PopulateTask {
    /// Creates a populate task for `partitions` workers. If the workers will share a store
    /// handle, it must be given as `shared` so its caches are reset too.
    #[must_use]
    pub fn new(store: StoreConfig, partitions: NonZero<usize>, shared: Option<Arc<Store>>) -> Self {
        Self {
            store,
            partitions,
            shared,
        }
    }
}

impl Task for PopulateTask {
    type Output = ();

    fn run(&self, identity: WorkerIdentity, _sync: &SyncPoint) -> Result<()> {
        let _span = debug_span!("phase", phase = %Phase::Populate, %identity).entered();

        let store = open_store(&self.store, self.shared.as_ref())?;
        store.reset(self.partitions.get())?;

        debug!(partitions = self.partitions.get(), "store populated");
        Ok(())
    }

    fn envelope(&self) -> Result<Option<Envelope>> {
        Envelope::of(self).map(Some)
    }
}

impl PortableTask for PopulateTask {
    const NAME: &'static str = "populate";
}

/// Adds objects to the worker's partition, then updates all of them, timing each transaction.
#[derive(Debug, Deserialize, Serialize)]
pub struct WriteTask {
    config: TrialConfiguration,
    store: StoreConfig,
    rep: u64,

    #[serde(skip)]
    shared: Option<Arc<Store>>,
}

impl WriteTask {
    /// Creates the write task of trial repetition `rep`.
    #[must_use]
    pub fn new(
        config: TrialConfiguration,
        store: StoreConfig,
        rep: u64,
        shared: Option<Arc<Store>>,
    ) -> Self {
        Self {
            config,
            store,
            rep,
            shared,
        }
    }
}

impl Task for WriteTask {
    type Output = Vec<WriteTimes>;

    fn run(&self, identity: WorkerIdentity, sync: &SyncPoint) -> Result<Vec<WriteTimes>> {
        let partition = identity.index();
        let reps = self.config.test_reps.get();

        let store = open_store(&self.store, self.shared.as_ref())?;

        // Payloads are generated up front so that generating them is not measured.
        let mut generator = PayloadGenerator::new(self.config.seed, identity, self.rep);
        let batches = (0..reps)
            .map(|_| {
                generator.payloads(self.config.objects_per_txn.get(), self.config.object_size)
            })
            .collect::<Vec<_>>();

        drop(store.connect());

        cross_into(Phase::WriteAdd, identity, sync)?;
        let add = {
            let _span = debug_span!("phase", phase = %Phase::WriteAdd, %identity).entered();

            batches
                .into_iter()
                .map(|batch| {
                    time_transaction(&store, |connection| {
                        connection.store_objects(partition, batch)?;
                        connection.commit()
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        cross_into(Phase::WriteUpdate, identity, sync)?;
        let update = {
            let _span = debug_span!("phase", phase = %Phase::WriteUpdate, %identity).entered();

            (0..reps)
                .map(|_| {
                    time_transaction(&store, |connection| {
                        connection.touch_all(partition)?;
                        connection.commit()
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        thread::sleep(SETTLE_BEFORE_CLOSE);
        // With a shared handle this only releases our reference.
        drop(store);

        Ok(add
            .into_iter()
            .zip(update)
            .map(|(add, update)| WriteTimes::new(add, update))
            .collect())
    }

    fn envelope(&self) -> Result<Option<Envelope>> {
        Envelope::of(self).map(Some)
    }
}

impl PortableTask for WriteTask {
    const NAME: &'static str = "write";
}

/// Reads every object of the worker's partition with progressively warmer caches, timing each
/// read and checking that the write phases stored what they should have.
#[derive(Debug, Deserialize, Serialize)]
pub struct ReadTask {
    config: TrialConfiguration,
    store: StoreConfig,

    #[serde(skip)]
    shared: Option<Arc<Store>>,
}

impl ReadTask {
    /// Creates a read task.
    #[must_use]
    pub fn new(config: TrialConfiguration, store: StoreConfig, shared: Option<Arc<Store>>) -> Self {
        Self {
            config,
            store,
            shared,
        }
    }

    fn read(
        &self,
        store: &Store,
        identity: WorkerIdentity,
        minimize_connection_cache: bool,
    ) -> Result<Duration> {
        let expected = self.config.objects_per_txn.get() as u64;

        time_transaction(store, |connection| {
            if minimize_connection_cache {
                connection.minimize_cache();
            }

            let observed = connection.sum_attrs(identity.index())?;

            if observed == expected {
                Ok(())
            } else {
                Err(Error::DataMismatch {
                    identity,
                    expected,
                    observed,
                })
            }
        })
    }

    fn clear_all_caches(&self, store: &Store, sync: &SyncPoint) -> Result<()> {
        if self.config.strategy.shares_store_handle() {
            // Nobody may be reading through the shared handle while its caches are cleared.
            sync.wait_for_leader_then(|| {
                store.clear_caches();
                Ok(())
            })
        } else {
            store.clear_caches();
            Ok(())
        }
    }
}

impl Task for ReadTask {
    type Output = Vec<ReadTimes>;

    fn run(&self, identity: WorkerIdentity, sync: &SyncPoint) -> Result<Vec<ReadTimes>> {
        let reps = self.config.test_reps.get();

        let store = open_store(&self.store, self.shared.as_ref())?;

        // Room for every object of the partition twice over.
        store.set_cache_size(self.config.objects_per_txn.get().saturating_mul(2));

        drop(store.connect());

        cross_into(Phase::ReadWarm, identity, sync)?;
        let warm = {
            let _span = debug_span!("phase", phase = %Phase::ReadWarm, %identity).entered();
            self.read(&store, identity, false)?
        };

        cross_into(Phase::ReadCold, identity, sync)?;
        let cold = {
            let _span = debug_span!("phase", phase = %Phase::ReadCold, %identity).entered();

            (0..reps)
                .map(|_| {
                    // Clearing everything already minimized the connection caches.
                    self.clear_all_caches(&store, sync)?;
                    self.read(&store, identity, false)
                })
                .collect::<Result<Vec<_>>>()?
        };

        cross_into(Phase::ReadHot, identity, sync)?;
        let hot = {
            let _span = debug_span!("phase", phase = %Phase::ReadHot, %identity).entered();

            (0..reps)
                .map(|_| self.read(&store, identity, true))
                .collect::<Result<Vec<_>>>()?
        };

        cross_into(Phase::ReadSteamIn, identity, sync)?;
        let steamin = {
            let _span = debug_span!("phase", phase = %Phase::ReadSteamIn, %identity).entered();

            (0..reps)
                .map(|_| self.read(&store, identity, false))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(cold
            .into_iter()
            .zip(hot)
            .zip(steamin)
            .map(|((cold, hot), steamin)| ReadTimes::new(warm, cold, hot, steamin))
            .collect())
    }

    fn envelope(&self) -> Result<Option<Envelope>> {
        Envelope::of(self).map(Some)
    }
}

impl PortableTask for ReadTask {
    const NAME: &'static str = "read";
}
