use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, ExecutionStrategy, Result};

/// Durations of one repetition of the write phases, as measured by one worker.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct WriteTimes {
    /// Time to add every object of the partition in one transaction.
    pub add: Duration,

    /// Time to modify every object of the partition in one transaction.
    pub update: Duration,
}

impl WriteTimes {
    /// Creates a write sample.
    #[must_use]
    pub fn new(add: Duration, update: Duration) -> Self {
        Self { add, update }
    }
}

/// Durations of one repetition of the read phases, as measured by one worker.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ReadTimes {
    /// Read right after the write phases, with whatever the caches hold by then. Measured once
    /// per worker and repeated in every sample.
    pub warm: Duration,

    /// Read after every cache was cleared.
    pub cold: Duration,

    /// Read with the backend cache populated but the connection cache minimized.
    pub hot: Duration,

    /// Read with every cache populated.
    pub steamin: Duration,
}

impl ReadTimes {
    /// Creates a read sample.
    #[must_use]
    pub fn new(warm: Duration, cold: Duration, hot: Duration, steamin: Duration) -> Self {
        Self {
            warm,
            cold,
            hot,
            steamin,
        }
    }
}

/// One raw sample: a write repetition paired with a read repetition of the same worker.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct SpeedTestTimes {
    /// The write half of the sample.
    #[serde(flatten)]
    pub write: WriteTimes,

    /// The read half of the sample.
    #[serde(flatten)]
    pub read: ReadTimes,
}

/// Everything measured by one trial.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TrialTimes {
    /// Every raw sample, all repetitions of the first worker first.
    pub samples: Vec<SpeedTestTimes>,

    /// Mean of each write phase over all samples.
    pub write_means: WriteTimes,

    /// Mean of each read phase over all samples.
    pub read_means: ReadTimes,
}

impl TrialTimes {
    /// Pairs up write and read samples and summarizes them.
    ///
    /// Both lists hold the samples of all workers in identity order, so the n-th write sample
    /// and the n-th read sample belong to the same worker and repetition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the lists differ in length, which means the write and
    /// read phases ran with different parameters.
    pub fn from_samples(write: &[WriteTimes], read: &[ReadTimes]) -> Result<Self> {
        if write.len() != read.len() {
            return Err(Error::Configuration(format!(
                "{} write samples cannot be paired with {} read samples",
                write.len(),
                read.len()
            )));
        }

        let samples = write
            .iter()
            .zip(read)
            .map(|(write, read)| SpeedTestTimes {
                write: *write,
                read: *read,
            })
            .collect::<Vec<_>>();

        let (write_means, read_means) = means(&samples);

        Ok(Self {
            samples,
            write_means,
            read_means,
        })
    }
}

/// The arithmetic mean of a set of durations, or zero for an empty set.
#[must_use]
pub fn mean<I>(durations: I) -> Duration
where
    I: IntoIterator<Item = Duration>,
{
    let mut count = 0_u32;
    let mut total = Duration::ZERO;

    for duration in durations {
        count = count.saturating_add(1);
        total = total.saturating_add(duration);
    }

    total.checked_div(count).unwrap_or_default()
}

fn means(samples: &[SpeedTestTimes]) -> (WriteTimes, ReadTimes) {
    (
        WriteTimes {
            add: mean(samples.iter().map(|s| s.write.add)),
            update: mean(samples.iter().map(|s| s.write.update)),
        },
        ReadTimes {
            warm: mean(samples.iter().map(|s| s.read.warm)),
            cold: mean(samples.iter().map(|s| s.read.cold)),
            hot: mean(samples.iter().map(|s| s.read.hot)),
            steamin: mean(samples.iter().map(|s| s.read.steamin)),
        },
    )
}

/// The trials of one contender at one object count and concurrency level.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ReportEntry {
    /// Name of the contender.
    pub contender: String,

    /// Objects written and read per transaction.
    pub objects_per_txn: usize,

    /// Number of concurrent workers.
    pub concurrency: usize,

    /// How the workers were executed.
    pub strategy: ExecutionStrategy,

    /// Every trial, in the order they ran.
    pub trials: Vec<TrialTimes>,
}

impl ReportEntry {
    /// Creates an entry without trials.
    #[must_use]
    pub fn new(
        contender: impl Into<String>,
        objects_per_txn: usize,
        concurrency: usize,
        strategy: ExecutionStrategy,
    ) -> Self {
        Self {
            contender: contender.into(),
            objects_per_txn,
            concurrency,
            strategy,
            trials: Vec::new(),
        }
    }

    /// Per-phase means over the samples of every trial.
    #[must_use]
    pub fn means(&self) -> (WriteTimes, ReadTimes) {
        let samples = self
            .trials
            .iter()
            .flat_map(|trial| trial.samples.iter().copied())
            .collect::<Vec<_>>();

        means(&samples)
    }
}

/// The results of a whole benchmark run.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct Report {
    /// One entry per contender, object count and concurrency level.
    pub entries: Vec<ReportEntry>,
}

const TABLE_HEADER: [&str; 9] = [
    "contender",
    "objects",
    "concurrency",
    "add",
    "update",
    "warm",
    "cold",
    "hot",
    "steamin",
];

impl Report {
    /// Writes a table of per-phase means in milliseconds, one row per entry.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying writer.
    pub fn write_table(&self, out: &mut impl Write) -> io::Result<()> {
        let name_width = self
            .entries
            .iter()
            .map(|entry| entry.contender.len())
            .chain([TABLE_HEADER[0].len()])
            .max()
            .unwrap_or_default();

        write!(out, "{:<name_width$}", TABLE_HEADER[0])?;
        for column in TABLE_HEADER.iter().skip(1) {
            write!(out, " {column:>11}")?;
        }
        writeln!(out)?;

        for entry in &self.entries {
            let (write, read) = entry.means();

            write!(
                out,
                "{:<name_width$} {:>11} {:>11}",
                entry.contender, entry.objects_per_txn, entry.concurrency
            )?;

            for duration in [
                write.add,
                write.update,
                read.warm,
                read.cold,
                read.hot,
                read.steamin,
            ] {
                write!(out, " {:>11.3}", duration.as_secs_f64() * 1000.0)?;
            }
            writeln!(out)?;
        }

        Ok(())
    }

    /// Writes every raw sample of the report to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Output`] if the file cannot be written.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::output("cannot encode report", e))?;

        fs::write(path, json)
            .map_err(|e| Error::output(&format!("cannot write {}", path.display()), e))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn mean_of_nothing_is_zero() {
        assert_eq!(mean(Vec::new()), Duration::ZERO);
    }

    #[test]
    fn mean_is_arithmetic() {
        assert_eq!(mean([ms(1), ms(2), ms(6)]), ms(3));
    }

    #[test]
    fn samples_pair_up_in_order() {
        let write = [WriteTimes::new(ms(1), ms(2)), WriteTimes::new(ms(3), ms(4))];
        let read = [
            ReadTimes::new(ms(10), ms(20), ms(30), ms(40)),
            ReadTimes::new(ms(10), ms(40), ms(50), ms(60)),
        ];

        let trial = TrialTimes::from_samples(&write, &read).unwrap();

        assert_eq!(trial.samples.len(), 2);
        assert_eq!(trial.samples.get(1).unwrap().write.add, ms(3));
        assert_eq!(trial.write_means, WriteTimes::new(ms(2), ms(3)));
        assert_eq!(trial.read_means, ReadTimes::new(ms(10), ms(30), ms(40), ms(50)));
    }

    #[test]
    fn unpaired_samples_are_rejected() {
        let result = TrialTimes::from_samples(&[WriteTimes::default()], &[]);

        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn table_has_row_per_entry() {
        let mut entry = ReportEntry::new("ram", 1000, 2, ExecutionStrategy::ThreadsSharedResource);
        entry.trials.push(
            TrialTimes::from_samples(
                &[WriteTimes::new(ms(5), ms(7))],
                &[ReadTimes::new(ms(1), ms(2), ms(3), ms(4))],
            )
            .unwrap(),
        );

        let report = Report {
            entries: vec![entry],
        };

        let mut out = Vec::new();
        report.write_table(&mut out).unwrap();
        let table = String::from_utf8(out).unwrap();

        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines.first().unwrap().starts_with("contender"));
        assert!(lines.get(1).unwrap().starts_with("ram"));
        assert!(lines.get(1).unwrap().contains("5.000"));
        assert!(lines.get(1).unwrap().contains("7.000"));
    }

    #[test]
    fn json_output_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let mut entry = ReportEntry::new("disk", 10, 1, ExecutionStrategy::MultiProcess);
        entry.trials.push(
            TrialTimes::from_samples(
                &[WriteTimes::new(ms(1), ms(1))],
                &[ReadTimes::new(ms(1), ms(1), ms(1), ms(1))],
            )
            .unwrap(),
        );
        let report = Report {
            entries: vec![entry],
        };

        report.write_json(&path).unwrap();

        let parsed: Report = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn unwritable_json_path_is_output_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("report.json");

        let result = Report::default().write_json(&path);

        assert!(matches!(result, Err(Error::Output(_))));
    }
}
