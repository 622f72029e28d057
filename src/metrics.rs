//! Prometheus metrics definitions and the per-repository sample registry.
//!
//! Collection runs produce [`MetricSample`]s described by the static
//! [`MetricDef`] catalog below. The [`MetricsRegistry`] keeps the latest
//! published sample set of every repository and renders all of them in the
//! Prometheus text format on scrape.

use crate::collector::{Check, CollectionOutcome};
use crate::error::{ExporterError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Label names shared by every per-group snapshot metric.
pub const GROUP_LABELS: &[&str] = &[
    "repository",
    "host",
    "username",
    "tag",
    "tags",
    "paths",
    "snapshot_hash",
];

const REPOSITORY_LABELS: &[&str] = &["repository"];
const STATS_LABELS: &[&str] = &["repository", "mode"];

/// Static description of one metric family.
#[derive(Debug, PartialEq)]
pub struct MetricDef {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
    /// Check whose data this metric carries; `None` for run status metrics
    pub check: Option<Check>,
}

macro_rules! metric {
    ($ident:ident, $name:expr, $help:expr, $labels:expr, $check:expr) => {
        pub static $ident: MetricDef = MetricDef {
            name: $name,
            help: $help,
            labels: $labels,
            check: $check,
        };
    };
}

// Run status
metric!(NEVER_COLLECTED, "restic_never_collected", "Whether no collection run has completed yet for the repository (1 = never collected)", REPOSITORY_LABELS, None);
metric!(COLLECTION_SUCCESS, "restic_collection_success", "Whether every check attempted in the last run succeeded (1 = success, 0 = failure)", REPOSITORY_LABELS, None);
metric!(LAST_ATTEMPT_TIMESTAMP, "restic_last_attempt_timestamp_seconds", "Unix timestamp of the last collection attempt", REPOSITORY_LABELS, None);
metric!(LAST_SUCCESS_TIMESTAMP, "restic_last_success_timestamp_seconds", "Unix timestamp of the last fully successful collection", REPOSITORY_LABELS, None);
metric!(COLLECTION_DURATION, "restic_collection_duration_seconds", "Duration of the last collection run in seconds", REPOSITORY_LABELS, None);
metric!(COLLECTION_TIMESTAMP, "restic_collection_timestamp_seconds", "Unix timestamp shared by the samples of the last published run", REPOSITORY_LABELS, None);
metric!(CHECK_SUCCESS, "restic_check_success", "Result of each check attempted in the last run (1 = success, 0 = failure)", &["repository", "check"], None);
metric!(LAST_ERROR_INFO, "restic_last_error_info", "Classification of the last failure of a check", &["repository", "check", "kind"], None);

// Locks
metric!(LOCK_HELD, "restic_lock_held", "Whether the repository was exclusively locked during the last run", REPOSITORY_LABELS, None);
metric!(LOCK_HELD_CONSECUTIVE_RUNS, "restic_lock_held_consecutive_runs", "Number of consecutive runs that found the repository locked", REPOSITORY_LABELS, None);
metric!(LOCK_ESCALATED, "restic_lock_escalated", "Whether the lock has been held for at least the configured number of runs", REPOSITORY_LABELS, None);
metric!(LOCKS_TOTAL, "restic_locks_total", "Total number of locks in the repository", REPOSITORY_LABELS, Some(Check::Locks));
metric!(LOCK_OLDEST_TIMESTAMP, "restic_lock_oldest_timestamp_seconds", "Creation timestamp of the oldest lock in the repository", REPOSITORY_LABELS, Some(Check::Locks));

// Snapshots
metric!(SNAPSHOTS_TOTAL, "restic_snapshots_total", "Total number of snapshots in the repository", REPOSITORY_LABELS, Some(Check::Snapshots));
metric!(BACKUP_TIMESTAMP, "restic_backup_timestamp_seconds", "Timestamp of the last backup", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_AGE, "restic_backup_age_seconds", "Age of the last backup in seconds, as of the last successful snapshots check", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_SNAPSHOTS_TOTAL, "restic_backup_snapshots_total", "Total number of snapshots in the backup group", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_MISSING, "restic_backup_missing", "Backup group that had snapshots earlier but has none now", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_FILES_NEW, "restic_backup_files_new", "Number of new files in the last backup", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_FILES_CHANGED, "restic_backup_files_changed", "Number of changed files in the last backup", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_FILES_UNMODIFIED, "restic_backup_files_unmodified", "Number of unmodified files in the last backup", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_FILES_PROCESSED, "restic_backup_files_processed", "Number of files processed in the last backup", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_BYTES_PROCESSED, "restic_backup_bytes_processed", "Number of bytes processed in the last backup", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_BYTES_ADDED, "restic_backup_bytes_added", "Number of bytes added in the last backup", GROUP_LABELS, Some(Check::Snapshots));
metric!(BACKUP_DURATION, "restic_backup_duration_seconds", "Amount of time the last backup took", GROUP_LABELS, Some(Check::Snapshots));

// Per-snapshot stats
metric!(BACKUP_SIZE_BYTES, "restic_backup_size_bytes", "Restore size of the last backup in bytes", GROUP_LABELS, Some(Check::SnapshotStats));
metric!(BACKUP_FILES_TOTAL, "restic_backup_files_total", "Number of files in the last backup", GROUP_LABELS, Some(Check::SnapshotStats));

// Repository stats
metric!(REPOSITORY_SIZE, "restic_repository_size_bytes", "Total size reported by restic stats", STATS_LABELS, Some(Check::Stats));
metric!(REPOSITORY_UNCOMPRESSED_SIZE, "restic_repository_uncompressed_size_bytes", "Uncompressed size reported by restic stats", STATS_LABELS, Some(Check::Stats));
metric!(REPOSITORY_FILES, "restic_repository_files_total", "Number of files reported by restic stats", STATS_LABELS, Some(Check::Stats));
metric!(REPOSITORY_BLOBS, "restic_repository_blobs_total", "Number of blobs reported by restic stats", STATS_LABELS, Some(Check::Stats));
metric!(REPOSITORY_COMPRESSION_RATIO, "restic_repository_compression_ratio", "Compression ratio reported by restic stats", STATS_LABELS, Some(Check::Stats));

// Integrity
metric!(INTEGRITY_ERRORS_FOUND, "restic_integrity_errors_found", "Whether the last completed restic check reported repository errors", REPOSITORY_LABELS, Some(Check::Integrity));

/// One labeled measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub def: &'static MetricDef,
    /// Values in the order of `def.labels`
    pub label_values: Vec<String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(
        def: &'static MetricDef,
        label_values: Vec<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        debug_assert_eq!(def.labels.len(), label_values.len(), "{}", def.name);
        Self {
            def,
            label_values,
            value,
            timestamp,
        }
    }

    pub fn name(&self) -> &'static str {
        self.def.name
    }

    /// Label value by name.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.def
            .labels
            .iter()
            .position(|l| *l == name)
            .map(|i| self.label_values[i].as_str())
    }

    pub fn repository(&self) -> &str {
        self.label("repository").unwrap_or_default()
    }
}

/// Sample set of a repository that has not completed a run yet.
fn never_collected(repository: &str) -> Vec<MetricSample> {
    vec![MetricSample::new(
        &NEVER_COLLECTED,
        vec![repository.to_string()],
        1.0,
        Utc::now(),
    )]
}

/// Latest published sample set of every repository.
///
/// Each repository's set is replaced as a whole, so readers see either the
/// previous or the new set and never a mix of the two. Sets of different
/// repositories live in independent map shards.
pub struct MetricsRegistry {
    order: Vec<String>,
    sets: DashMap<String, Arc<Vec<MetricSample>>>,
    exporter: Registry,
    scrapes_total: IntCounter,
}

impl MetricsRegistry {
    /// Create a registry for the given repositories, each starting in the
    /// never-collected state.
    pub fn new<I, S>(repositories: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let order: Vec<String> = repositories.into_iter().map(Into::into).collect();
        let sets = DashMap::new();
        for id in &order {
            sets.insert(id.clone(), Arc::new(never_collected(id)));
        }

        let exporter = Registry::new();
        let scrapes_total = IntCounter::with_opts(Opts::new(
            "restic_exporter_scrapes_total",
            "Number of metrics scrapes served",
        ))?;
        exporter.register(Box::new(scrapes_total.clone()))?;

        #[cfg(target_os = "linux")]
        exporter.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            order,
            sets,
            exporter,
            scrapes_total,
        })
    }

    /// Publish the result of a collection run.
    ///
    /// Samples of checks that did not produce fresh data in this run (failed
    /// or skipped) are carried over from the previously published set,
    /// unless this run emitted the same series again.
    pub fn publish(&self, outcome: &CollectionOutcome) {
        let Some(mut entry) = self.sets.get_mut(&outcome.repository) else {
            warn!(
                "Ignoring outcome for unknown repository {}",
                outcome.repository
            );
            return;
        };

        let fresh: HashSet<Check> = outcome.fresh_checks().collect();
        // A partially failed check still replaces the series it re-emitted
        let emitted: HashSet<(&str, &[String])> = outcome
            .samples
            .iter()
            .map(|s| (s.def.name, s.label_values.as_slice()))
            .collect();
        let carried: Vec<MetricSample> = entry
            .value()
            .iter()
            .filter(|s| s.def.check.is_some_and(|c| !fresh.contains(&c)))
            .filter(|s| !emitted.contains(&(s.def.name, s.label_values.as_slice())))
            .cloned()
            .collect();

        let mut samples = outcome.samples.clone();
        samples.extend(carried);

        debug!(
            "Publishing {} samples for {}",
            samples.len(),
            outcome.repository
        );
        *entry.value_mut() = Arc::new(samples);
    }

    /// Point-in-time copy of every repository's current sample set, in
    /// configuration order.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples = Vec::new();
        for id in &self.order {
            let set = self.sets.get(id).map(|entry| Arc::clone(entry.value()));
            if let Some(set) = set {
                samples.extend(set.iter().cloned());
            }
        }
        samples
    }

    /// Encode the current sample sets and exporter metrics in Prometheus
    /// text format.
    pub fn encode(&self) -> Result<String> {
        self.scrapes_total.inc();

        let families = render_families(&self.snapshot())?;
        let exporter_families = self.exporter.gather();

        let encoder = TextEncoder::new();

        // Reuse buffer to avoid allocation on every scrape
        thread_local! {
            static BUFFER: std::cell::RefCell<Vec<u8>> = std::cell::RefCell::new(Vec::with_capacity(8192));
        }

        BUFFER.with(|buf| {
            let mut buffer = buf.borrow_mut();
            buffer.clear();

            encoder.encode(&families, &mut *buffer)?;
            encoder.encode(&exporter_families, &mut *buffer)?;

            String::from_utf8(buffer.clone()).map_err(|e| ExporterError::Metrics(e.to_string()))
        })
    }
}

/// Build Prometheus metric families from samples.
fn render_families(samples: &[MetricSample]) -> Result<Vec<MetricFamily>> {
    let mut by_def: BTreeMap<&'static str, (&'static MetricDef, Vec<&MetricSample>)> =
        BTreeMap::new();
    for sample in samples {
        by_def
            .entry(sample.def.name)
            .or_insert_with(|| (sample.def, Vec::new()))
            .1
            .push(sample);
    }

    let registry = Registry::new();
    for (def, samples) in by_def.into_values() {
        let gauge = GaugeVec::new(Opts::new(def.name, def.help), def.labels)?;
        for sample in samples {
            let values: Vec<&str> = sample.label_values.iter().map(String::as_str).collect();
            gauge.with_label_values(&values[..]).set(sample.value);
        }
        registry.register(Box::new(gauge))?;
    }
    Ok(registry.gather())
}
