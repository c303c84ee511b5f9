// Databases kept in process memory, shared by name between every handle in the process.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use super::{Backend, Partition};
use crate::{Error, Result};

type Database = Arc<Mutex<Vec<Partition>>>;

static DATABASES: LazyLock<Mutex<HashMap<String, Database>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(derive_more::Debug)]
pub(super) struct MemoryBackend {
    name: String,

    #[debug(ignore)]
    database: Database,
}

impl MemoryBackend {
    pub(super) fn open(name: &str) -> Self {
        let database = Arc::clone(DATABASES.lock().entry(name.to_string()).or_default());

        Self {
            name: name.to_string(),
            database,
        }
    }

    fn missing(&self, partition: usize) -> Error {
        Error::Store(format!(
            "partition {partition} does not exist in memory database '{}'",
            self.name
        ))
    }
}

impl Backend for MemoryBackend {
    fn reset(&self, partitions: usize) -> Result<()> {
        let mut database = self.database.lock();
        database.clear();
        database.resize_with(partitions, Partition::new);
        Ok(())
    }

    fn load(&self, partition: usize) -> Result<Partition> {
        self.database
            .lock()
            .get(partition)
            .cloned()
            .ok_or_else(|| self.missing(partition))
    }

    fn commit(&self, partition: usize, objects: &Partition) -> Result<()> {
        let mut database = self.database.lock();

        let stored = database
            .get_mut(partition)
            .ok_or_else(|| self.missing(partition))?;
        stored.clone_from(objects);

        Ok(())
    }

    // Every load already copies from the shared map; there is nothing in between to clear.
    fn clear_cache(&self) -> bool {
        false
    }
}
