// Databases kept as one JSON file per partition in a directory.
//
// Commits write the new contents to a temporary file in the same directory and move it over the
// old file, so a reader in another process sees either the old or the new partition, never a
// torn one.

use std::collections::HashMap;
use std::fs::{self, File};
use std::fmt;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::trace;

use super::{Backend, Partition};
use crate::{Error, Result};

const FILE_PREFIX: &str = "partition-";
const FILE_SUFFIX: &str = ".json";

#[derive(derive_more::Debug)]
pub(super) struct DirectoryBackend {
    path: PathBuf,

    // Decoded partitions, so repeated loads skip reading and parsing the file.
    #[debug(ignore)]
    decoded: Mutex<HashMap<usize, Partition>>,
}

impl DirectoryBackend {
    pub(super) fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)
            .map_err(|e| Error::store(&format!("cannot create {}", path.display()), e))?;

        Ok(Self {
            path: path.to_path_buf(),
            decoded: Mutex::new(HashMap::new()),
        })
    }

    fn partition_path(&self, partition: usize) -> PathBuf {
        self.path
            .join(format!("{FILE_PREFIX}{partition:04}{FILE_SUFFIX}"))
    }

    fn read(&self, partition: usize) -> Result<Partition> {
        let path = self.partition_path(partition);

        let file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::Store(format!(
                    "partition {partition} does not exist in {}",
                    self.path.display()
                ))
            } else {
                Error::store(&format!("cannot open {}", path.display()), e)
            }
        })?;

        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::store(&format!("cannot decode {}", path.display()), e))
    }

    fn write(&self, partition: usize, objects: &Partition) -> Result<()> {
        let path = self.partition_path(partition);
        let failed = |e: &dyn fmt::Display| {
            Error::store(&format!("cannot write {}", path.display()), e)
        };

        let temp = NamedTempFile::new_in(&self.path).map_err(|e| failed(&e))?;

        let mut writer = BufWriter::new(temp);
        serde_json::to_writer(&mut writer, objects).map_err(|e| failed(&e))?;
        writer.flush().map_err(|e| failed(&e))?;

        let temp = writer.into_inner().map_err(|e| failed(&e))?;
        temp.persist(&path).map_err(|e| failed(&e))?;

        Ok(())
    }

    fn is_partition_file(name: &str) -> bool {
        name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX)
    }
}

impl Backend for DirectoryBackend {
    fn reset(&self, partitions: usize) -> Result<()> {
        self.decoded.lock().clear();

        let entries = fs::read_dir(&self.path)
            .map_err(|e| Error::store(&format!("cannot list {}", self.path.display()), e))?;

        for entry in entries {
            let entry = entry
                .map_err(|e| Error::store(&format!("cannot list {}", self.path.display()), e))?;

            if entry.file_name().to_str().is_some_and(Self::is_partition_file) {
                fs::remove_file(entry.path()).map_err(|e| {
                    Error::store(&format!("cannot remove {}", entry.path().display()), e)
                })?;
            }
        }

        let empty = Partition::new();
        for partition in 0..partitions {
            self.write(partition, &empty)?;
        }

        trace!(path = %self.path.display(), partitions, "directory store reset");

        Ok(())
    }

    fn load(&self, partition: usize) -> Result<Partition> {
        if let Some(objects) = self.decoded.lock().get(&partition) {
            return Ok(objects.clone());
        }

        let objects = self.read(partition)?;
        self.decoded.lock().insert(partition, objects.clone());

        Ok(objects)
    }

    fn commit(&self, partition: usize, objects: &Partition) -> Result<()> {
        // Partitions only come into existence through reset().
        if !self.partition_path(partition).exists() {
            return Err(Error::Store(format!(
                "partition {partition} does not exist in {}",
                self.path.display()
            )));
        }

        self.write(partition, objects)?;
        self.decoded.lock().insert(partition, objects.clone());

        Ok(())
    }

    fn clear_cache(&self) -> bool {
        self.decoded.lock().clear();
        true
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::store::StoredObject;

    fn one_object() -> Partition {
        let mut objects = Partition::new();
        objects.insert(
            7,
            StoredObject {
                data: "payload".to_string(),
                attr: 1,
            },
        );
        objects
    }

    #[test]
    fn reset_creates_empty_partition_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::open(dir.path()).unwrap();

        backend.reset(3).unwrap();

        for partition in 0..3 {
            assert!(backend.partition_path(partition).exists());
            assert!(backend.load(partition).unwrap().is_empty());
        }
        assert!(!backend.partition_path(3).exists());
    }

    #[test]
    fn reset_removes_old_partitions_only() {
        let dir = tempfile::tempdir().unwrap();
        let unrelated = dir.path().join("notes.txt");
        fs::write(&unrelated, "keep me").unwrap();

        let backend = DirectoryBackend::open(dir.path()).unwrap();
        backend.reset(4).unwrap();
        backend.reset(1).unwrap();

        assert!(!backend.partition_path(3).exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn commits_are_visible_to_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DirectoryBackend::open(dir.path()).unwrap();
        let reader = DirectoryBackend::open(dir.path()).unwrap();

        writer.reset(1).unwrap();
        writer.commit(0, &one_object()).unwrap();

        assert_eq!(reader.load(0).unwrap(), one_object());
    }

    #[test]
    fn decoded_cache_hides_foreign_commits_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DirectoryBackend::open(dir.path()).unwrap();
        let reader = DirectoryBackend::open(dir.path()).unwrap();

        writer.reset(1).unwrap();
        assert!(reader.load(0).unwrap().is_empty());

        writer.commit(0, &one_object()).unwrap();
        assert!(reader.load(0).unwrap().is_empty());

        assert!(reader.clear_cache());
        assert_eq!(reader.load(0).unwrap(), one_object());
    }

    #[test]
    fn corrupt_file_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::open(dir.path()).unwrap();
        backend.reset(1).unwrap();

        fs::write(backend.partition_path(0), "not json").unwrap();

        assert!(matches!(backend.load(0), Err(Error::Store(_))));
    }
}
