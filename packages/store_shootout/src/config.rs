use std::fs;
use std::num::NonZero;
use std::path::{Path, PathBuf};
use std::time::Duration;

use new_zealand::nz;
use serde::{Deserialize, Serialize};

use crate::executor::{DEFAULT_BARRIER_TIMEOUT, DEFAULT_TRIAL_TIMEOUT};
use crate::{Error, ExecutionStrategy, Result};

/// The parameters of one trial.
///
/// Every field has a default, so a configuration can be deserialized from a partial document
/// or built by adjusting [`TrialConfiguration::default()`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
#[non_exhaustive]
pub struct TrialConfiguration {
    /// How many workers run at the same time.
    pub concurrency: NonZero<usize>,

    /// How many objects each worker writes and reads per transaction.
    pub objects_per_txn: NonZero<usize>,

    /// Approximate size of the payload of each object, in bytes.
    pub object_size: usize,

    /// How the workers are executed.
    pub strategy: ExecutionStrategy,

    /// How many times each timed phase is repeated by each worker.
    pub test_reps: NonZero<usize>,

    /// Seed from which every worker derives its payload generator.
    pub seed: u64,

    /// Bound on every wait at a phase barrier.
    pub barrier_timeout: Duration,

    /// Bound on joining the workers of one pool, counted from their launch.
    pub trial_timeout: Duration,
}

impl Default for TrialConfiguration {
    fn default() -> Self {
        Self {
            concurrency: nz!(2),
            objects_per_txn: nz!(1000),
            object_size: 128,
            strategy: ExecutionStrategy::default(),
            test_reps: nz!(20),
            seed: 0,
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
            trial_timeout: DEFAULT_TRIAL_TIMEOUT,
        }
    }
}

impl TrialConfiguration {
    /// Checks that a trial with this configuration can be executed against `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for combinations that cannot work, such as an in-memory
    /// store with workers in separate processes.
    pub fn validate_for(&self, store: &StoreConfig) -> Result<()> {
        if self.strategy.uses_processes() && !store.is_visible_across_processes() {
            return Err(Error::Configuration(format!(
                "the {} store is not visible across processes and cannot be used with the {} strategy",
                store.kind_name(),
                self.strategy
            )));
        }

        Ok(())
    }
}

/// Where a contender keeps its objects. This is the factory for [`Store`][crate::Store]
/// handles: every worker that needs its own handle calls [`open()`][Self::open].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum StoreConfig {
    /// A database kept in the memory of the current process. Handles opened with the same name
    /// in the same process see the same data.
    Memory {
        /// Name of the database within the process.
        #[serde(default = "default_memory_name")]
        name: String,
    },

    /// A database kept as files in a directory, one file per partition.
    Directory {
        /// The directory holding the database. Created if it does not exist.
        path: PathBuf,
    },
}

fn default_memory_name() -> String {
    "shootout".to_string()
}

impl StoreConfig {
    /// An in-memory database with the given name.
    #[must_use]
    pub fn memory(name: impl Into<String>) -> Self {
        Self::Memory { name: name.into() }
    }

    /// A database stored in the given directory.
    #[must_use]
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::Directory { path: path.into() }
    }

    /// Whether worker processes opening this store see the same data.
    #[must_use]
    pub fn is_visible_across_processes(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            Self::Directory { .. } => "directory",
        }
    }
}

/// One store being measured, as named in the contenders file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct Contender {
    /// Name shown in the report.
    pub name: String,

    /// The store the contender measures.
    pub store: StoreConfig,
}

impl Contender {
    /// Creates a contender.
    #[must_use]
    pub fn new(name: impl Into<String>, store: StoreConfig) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContendersFile {
    #[serde(rename = "contender", default)]
    contenders: Vec<Contender>,
}

/// Parses the contenders from the text of a contenders file.
///
/// # Examples
///
/// ```
/// use store_shootout::parse_contenders;
///
/// let contenders = parse_contenders(
///     r#"
///     [[contender]]
///     name = "in-memory"
///     store = { kind = "memory" }
///
///     [[contender]]
///     name = "files"
///     store = { kind = "directory", path = "/tmp/shootout" }
///     "#,
/// )
/// .unwrap();
///
/// assert_eq!(contenders.len(), 2);
/// ```
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the text is not a valid contenders file, if it names
/// no contenders or if two contenders share a name.
pub fn parse_contenders(text: &str) -> Result<Vec<Contender>> {
    let file: ContendersFile = toml::from_str(text)
        .map_err(|e| Error::Configuration(format!("invalid contenders file: {e}")))?;

    if file.contenders.is_empty() {
        return Err(Error::Configuration(
            "the contenders file names no contenders".to_string(),
        ));
    }

    for (index, contender) in file.contenders.iter().enumerate() {
        let duplicate = file
            .contenders
            .iter()
            .skip(index.saturating_add(1))
            .any(|other| other.name == contender.name);

        if duplicate {
            return Err(Error::Configuration(format!(
                "contender '{}' is listed more than once",
                contender.name
            )));
        }
    }

    Ok(file.contenders)
}

/// Reads and parses a contenders file.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the file cannot be read or parsed.
pub fn load_contenders(path: &Path) -> Result<Vec<Contender>> {
    let text = fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("cannot read contenders file {}: {e}", path.display()))
    })?;

    parse_contenders(&text)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TrialConfiguration::default();

        assert_eq!(config.objects_per_txn.get(), 1000);
        assert_eq!(config.object_size, 128);
        assert_eq!(config.test_reps.get(), 20);
        assert_eq!(config.strategy, ExecutionStrategy::MultiProcess);
        assert_eq!(config.barrier_timeout, Duration::from_secs(120));
        assert_eq!(config.trial_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn partial_document_fills_in_defaults() {
        let config: TrialConfiguration =
            serde_json::from_str(r#"{ "concurrency": 4, "strategy": "threads-shared-resource" }"#)
                .unwrap();

        assert_eq!(config.concurrency.get(), 4);
        assert_eq!(config.strategy, ExecutionStrategy::ThreadsSharedResource);
        assert_eq!(config.objects_per_txn.get(), 1000);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let result = serde_json::from_str::<TrialConfiguration>(r#"{ "concurrency": 0 }"#);

        assert!(result.is_err());
    }

    #[test]
    fn memory_store_cannot_cross_processes() {
        let mut config = TrialConfiguration::default();

        config.strategy = ExecutionStrategy::MultiProcess;
        assert!(matches!(
            config.validate_for(&StoreConfig::memory("x")),
            Err(Error::Configuration(_))
        ));
        config.validate_for(&StoreConfig::directory("/tmp/x")).unwrap();

        config.strategy = ExecutionStrategy::ThreadsPerWorkerResource;
        config.validate_for(&StoreConfig::memory("x")).unwrap();
    }

    #[test]
    fn contenders_file_parses_both_kinds() {
        let contenders = parse_contenders(
            r#"
            [[contender]]
            name = "ram"
            store = { kind = "memory", name = "bench" }

            [[contender]]
            name = "disk"

            [contender.store]
            kind = "directory"
            path = "/var/tmp/shootout"
            "#,
        )
        .unwrap();

        assert_eq!(
            contenders,
            vec![
                Contender::new("ram", StoreConfig::memory("bench")),
                Contender::new("disk", StoreConfig::directory("/var/tmp/shootout")),
            ]
        );
    }

    #[test]
    fn memory_name_defaults() {
        let contenders = parse_contenders(
            r#"
            [[contender]]
            name = "ram"
            store = { kind = "memory" }
            "#,
        )
        .unwrap();

        assert_eq!(
            contenders.first().map(|c| &c.store),
            Some(&StoreConfig::memory("shootout"))
        );
    }

    #[test]
    fn bad_contenders_files_are_configuration_errors() {
        for text in [
            "",
            "[[contender]]\nname = \"x\"\nstore = { kind = \"tape\" }\n",
            "[[contender]]\nname = \"x\"\nstore = { kind = \"memory\" }\n\
             [[contender]]\nname = \"x\"\nstore = { kind = \"memory\" }\n",
            "[[contestant]]\nname = \"x\"\n",
        ] {
            assert!(
                matches!(parse_contenders(text), Err(Error::Configuration(_))),
                "{text}"
            );
        }
    }
}
