//! The object store being measured.
//!
//! A [`Store`] handle is the unit that workers share or do not share, depending on the execution
//! strategy. Work is done through [`Connection`]s opened from the handle. Each connection has
//! an object cache; closing a connection returns its cache to the handle's pool, where the next
//! connection picks it up again, so repeated reads through the same handle get faster as the
//! caches warm up.
//!
//! The data is organized in partitions, one per worker, each mapping an object key to a
//! [`StoredObject`].

mod directory;
mod memory;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{self, AtomicUsize};
use std::{fmt, mem};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{Result, StoreConfig};
use directory::DirectoryBackend;
use memory::MemoryBackend;

/// One object in the store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct StoredObject {
    /// The payload written by the add phase.
    pub data: String,

    /// Zero when added, set to one by the update phase.
    pub attr: u64,
}

type Partition = BTreeMap<usize, StoredObject>;

// Where committed partitions live. Implementations decide for themselves whether they keep a
// cache of their own that `clear_cache()` can drop.
trait Backend: fmt::Debug + Send + Sync {
    fn reset(&self, partitions: usize) -> Result<()>;

    fn load(&self, partition: usize) -> Result<Partition>;

    fn commit(&self, partition: usize, objects: &Partition) -> Result<()>;

    fn clear_cache(&self) -> bool;
}

impl StoreConfig {
    /// Opens a new handle to the configured store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`][crate::Error::Store] if the store cannot be opened.
    pub fn open(&self) -> Result<Store> {
        let backend: Box<dyn Backend> = match self {
            Self::Memory { name } => Box::new(MemoryBackend::open(name)),
            Self::Directory { path } => Box::new(DirectoryBackend::open(path)?),
        };

        debug!(?backend, "store opened");

        Ok(Store {
            backend,
            pool: Mutex::new(Vec::new()),
            cache_size: AtomicUsize::new(DEFAULT_CACHE_SIZE),
            serials: Mutex::new(HashMap::new()),
        })
    }
}

const DEFAULT_CACHE_SIZE: usize = 400;

/// A handle to a store, the source of [`Connection`]s.
#[derive(derive_more::Debug)]
pub struct Store {
    backend: Box<dyn Backend>,

    #[debug(ignore)]
    pool: Mutex<Vec<ObjectCache>>,

    /// Target number of objects kept in each connection cache.
    cache_size: AtomicUsize,

    // Bumped on every commit of a partition through this handle. A cached partition loaded
    // under an older serial is stale and gets reloaded.
    #[debug(ignore)]
    serials: Mutex<HashMap<usize, u64>>,
}

impl Store {
    /// Opens a connection, reusing a pooled object cache if one is available.
    pub fn connect(&self) -> Connection<'_> {
        let cache = self.pool.lock().pop().unwrap_or_default();

        Connection {
            store: self,
            cache,
        }
    }

    /// Sets the number of objects each connection cache aims to keep.
    pub fn set_cache_size(&self, objects: usize) {
        self.cache_size.store(objects, atomic::Ordering::Relaxed);
    }

    /// The number of objects each connection cache aims to keep.
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.cache_size.load(atomic::Ordering::Relaxed)
    }

    /// Wipes the database and creates `partitions` empty partitions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`][crate::Error::Store] if the backend cannot be reset.
    pub fn reset(&self, partitions: usize) -> Result<()> {
        self.pool.lock().clear();

        for serial in self.serials.lock().values_mut() {
            *serial = serial.wrapping_add(1);
        }

        self.backend.reset(partitions)
    }

    /// Drops every cached object: the caches of pooled connections and, if the backend has
    /// one, the backend cache.
    ///
    /// Returns whether the backend had a cache to clear. Connections that are open while this
    /// is called keep their caches.
    pub fn clear_caches(&self) -> bool {
        for cache in self.pool.lock().iter_mut() {
            cache.minimize();
        }

        let cleared = self.backend.clear_cache();
        trace!(backend_cache_cleared = cleared, "store caches cleared");
        cleared
    }

    fn serial(&self, partition: usize) -> u64 {
        self.serials.lock().get(&partition).copied().unwrap_or(0)
    }

    fn bump_serial(&self, partition: usize) -> u64 {
        let mut serials = self.serials.lock();
        let serial = serials.entry(partition).or_insert(0);
        *serial = serial.wrapping_add(1);
        *serial
    }
}

#[derive(Debug, Default)]
struct ObjectCache {
    partitions: HashMap<usize, CachedPartition>,
}

#[derive(Debug)]
struct CachedPartition {
    serial: u64,
    objects: Partition,
    dirty: bool,
}

impl ObjectCache {
    fn minimize(&mut self) {
        self.partitions.retain(|_, cached| cached.dirty);
    }

    // Evicts clean partitions other than `keep` until the cache fits `limit` objects, if it can.
    fn shrink_to(&mut self, limit: usize, keep: usize) {
        let mut total = self
            .partitions
            .values()
            .map(|cached| cached.objects.len())
            .sum::<usize>();

        if total <= limit {
            return;
        }

        let evictable = self
            .partitions
            .iter()
            .filter(|(key, cached)| **key != keep && !cached.dirty)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        for key in evictable {
            if total <= limit {
                break;
            }

            if let Some(evicted) = self.partitions.remove(&key) {
                total = total.saturating_sub(evicted.objects.len());
            }
        }
    }
}

/// A connection to a [`Store`], through which objects are read and written.
///
/// Changes are only visible to other connections after [`commit()`][Self::commit]. Dropping a
/// connection discards uncommitted changes and returns its object cache to the store's pool.
#[derive(Debug)]
pub struct Connection<'a> {
    store: &'a Store,
    cache: ObjectCache,
}

impl Connection<'_> {
    /// Adds objects with the given payloads to a partition, keyed `0..`, replacing any objects
    /// already stored under those keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`][crate::Error::Store] if the partition cannot be loaded.
    pub fn store_objects<I>(&mut self, partition: usize, payloads: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let cached = self.partition_mut(partition)?;

        for (key, data) in payloads.into_iter().enumerate() {
            cached.objects.insert(key, StoredObject { data, attr: 0 });
        }

        cached.dirty = true;
        Ok(())
    }

    /// Sets `attr` to one on every object of a partition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`][crate::Error::Store] if the partition cannot be loaded.
    pub fn touch_all(&mut self, partition: usize) -> Result<()> {
        let cached = self.partition_mut(partition)?;

        for object in cached.objects.values_mut() {
            object.attr = 1;
        }

        cached.dirty = true;
        Ok(())
    }

    /// Reads every object of a partition and returns the sum of their `attr` values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`][crate::Error::Store] if the partition cannot be loaded.
    pub fn sum_attrs(&mut self, partition: usize) -> Result<u64> {
        let cached = self.partition_mut(partition)?;

        Ok(cached
            .objects
            .values()
            .fold(0_u64, |sum, object| sum.saturating_add(object.attr)))
    }

    /// Drops every clean object from this connection's cache.
    pub fn minimize_cache(&mut self) {
        self.cache.minimize();
    }

    /// Makes the changes of this connection durable and visible to other connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`][crate::Error::Store] if the backend fails to commit. Partitions
    /// committed before the failure stay committed.
    pub fn commit(&mut self) -> Result<()> {
        let mut dirty = self
            .cache
            .partitions
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        dirty.sort_unstable();

        for partition in dirty {
            let cached = self
                .cache
                .partitions
                .get_mut(&partition)
                .expect("dirty partitions were just listed from this cache");

            self.store.backend.commit(partition, &cached.objects)?;

            cached.serial = self.store.bump_serial(partition);
            cached.dirty = false;
        }

        Ok(())
    }

    fn partition_mut(&mut self, partition: usize) -> Result<&mut CachedPartition> {
        let serial = self.store.serial(partition);

        let fresh = self
            .cache
            .partitions
            .get(&partition)
            .is_some_and(|cached| cached.dirty || cached.serial == serial);

        if !fresh {
            let objects = self.store.backend.load(partition)?;

            self.cache.partitions.insert(
                partition,
                CachedPartition {
                    serial,
                    objects,
                    dirty: false,
                },
            );

            self.cache.shrink_to(self.store.cache_size(), partition);
        }

        Ok(self
            .cache
            .partitions
            .get_mut(&partition)
            .expect("the partition was cached above if it was not already"))
    }
}

impl Drop for Connection<'_> {
    fn drop(&mut self) {
        let mut cache = mem::take(&mut self.cache);

        // Uncommitted changes die with the connection.
        cache.partitions.retain(|_, cached| !cached.dirty);

        self.store.pool.lock().push(cache);
    }
}
