//! Per-repository collection.
//!
//! A [`Collector`] runs the enabled checks against one repository in a fixed
//! order (snapshots, stats, per-snapshot stats, locks, integrity) and turns
//! their results into a flat sample set. Every command failure is classified
//! and reported as a sample; a run never fails as a whole.

use crate::config::{RepositoryConfig, ResticConfig, StatsMode, StatsScope};
use crate::metrics::{self, MetricDef, MetricSample};
use crate::restic::{
    Command, CommandFailure, CommandRunner, FailureKind, IntegrityReport, LockState, Payload,
    RepositoryStats, SnapshotInfo, StatsTarget,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Checks a run can perform, also used as the `check` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Check {
    Snapshots,
    Stats,
    SnapshotStats,
    Locks,
    Integrity,
}

impl Check {
    pub fn label(&self) -> &'static str {
        match self {
            Check::Snapshots => "snapshots",
            Check::Stats => "stats",
            Check::SnapshotStats => "snapshot_stats",
            Check::Locks => "locks",
            Check::Integrity => "integrity",
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of one check within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Completed and produced data
    Ok,
    /// Completed and produced data describing a broken repository
    Unhealthy,
    /// Most recent failure classification of this check in the run
    Failed(FailureKind),
    /// Not attempted because the repository was locked
    Skipped,
}

impl CheckStatus {
    /// Whether the run produced fresh data for this check.
    pub fn is_fresh(&self) -> bool {
        matches!(self, CheckStatus::Ok | CheckStatus::Unhealthy)
    }
}

/// Record of one collection run.
#[derive(Debug, Clone)]
pub struct CollectionOutcome {
    pub repository: String,
    /// Start of the run; the timestamp of every sample in `samples`
    pub attempted_at: DateTime<Utc>,
    /// Start of the most recent fully successful run, this one included
    pub last_success: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub checks: Vec<(Check, CheckStatus)>,
    pub lock_held: bool,
    pub samples: Vec<MetricSample>,
}

impl CollectionOutcome {
    /// Whether every attempted check succeeded.
    pub fn success(&self) -> bool {
        all_ok(&self.checks, self.lock_held)
    }

    pub fn status(&self, check: Check) -> Option<CheckStatus> {
        self.checks
            .iter()
            .find(|(c, _)| *c == check)
            .map(|(_, status)| *status)
    }

    /// Checks whose data in this run replaces previously published data.
    pub fn fresh_checks(&self) -> impl Iterator<Item = Check> + '_ {
        self.checks
            .iter()
            .filter(|(_, status)| status.is_fresh())
            .map(|(check, _)| *check)
    }

    /// Samples of the given metric.
    pub fn samples_of<'a>(
        &'a self,
        def: &'a MetricDef,
    ) -> impl Iterator<Item = &'a MetricSample> + 'a {
        self.samples.iter().filter(move |s| s.def == def)
    }
}

fn all_ok(checks: &[(Check, CheckStatus)], lock_held: bool) -> bool {
    !lock_held
        && !checks.is_empty()
        && checks
            .iter()
            .all(|(_, status)| matches!(status, CheckStatus::Ok | CheckStatus::Skipped))
}

/// Options shared by every repository's collector.
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub timeout: Duration,
    pub check_timeout: Duration,
    pub include_paths: bool,
    pub lock_escalation_threshold: Option<u32>,
}

impl From<&ResticConfig> for CollectorOptions {
    fn from(config: &ResticConfig) -> Self {
        Self {
            timeout: config.timeout(),
            check_timeout: config.check_timeout(),
            include_paths: config.include_paths,
            lock_escalation_threshold: config.lock_escalation_threshold,
        }
    }
}

/// Snapshots that belong to the same backup source.
///
/// Sources are always told apart by their paths, whether or not the paths
/// are exported as a label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    host: String,
    username: String,
    tags: Vec<String>,
    paths: Vec<String>,
}

impl GroupKey {
    fn of(snapshot: &SnapshotInfo) -> Self {
        Self {
            host: snapshot.hostname.clone(),
            username: snapshot.username.clone(),
            tags: snapshot.tags.clone(),
            paths: snapshot.paths.clone(),
        }
    }

    /// SHA-256 of host, user and paths, stable across restarts.
    fn source_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.host.as_bytes());
        hasher.update(self.username.as_bytes());
        hasher.update(self.paths.join(",").as_bytes());
        hex::encode(hasher.finalize())
    }

    fn label_values(&self, repository: &str, include_paths: bool) -> Vec<String> {
        vec![
            repository.to_string(),
            self.host.clone(),
            self.username.clone(),
            self.tags.first().cloned().unwrap_or_default(),
            self.tags.join(","),
            if include_paths {
                self.paths.join(",")
            } else {
                String::new()
            },
            self.source_hash(),
        ]
    }
}

/// Latest snapshot and snapshot count of one group.
struct Group<'a> {
    latest: &'a SnapshotInfo,
    count: usize,
}

fn group_snapshots(snapshots: &[SnapshotInfo]) -> BTreeMap<GroupKey, Group<'_>> {
    let mut groups: BTreeMap<GroupKey, Group<'_>> = BTreeMap::new();
    for snapshot in snapshots {
        groups
            .entry(GroupKey::of(snapshot))
            .and_modify(|g| {
                g.count += 1;
                if (snapshot.time, &snapshot.id) > (g.latest.time, &g.latest.id) {
                    g.latest = snapshot;
                }
            })
            .or_insert(Group {
                latest: snapshot,
                count: 1,
            });
    }
    groups
}

/// Collects one repository.
///
/// Keeps state that spans runs: the last success time, the per-snapshot
/// stats cache, the groups seen so far and the lock-held streak.
pub struct Collector {
    repository: Arc<RepositoryConfig>,
    runner: Arc<dyn CommandRunner>,
    options: CollectorOptions,
    stats_cache: HashMap<String, RepositoryStats>,
    known_groups: BTreeSet<GroupKey>,
    lock_streak: u32,
    last_success: Option<DateTime<Utc>>,
}

/// Samples and check results accumulated during one run.
struct Run<'a> {
    repository: &'a str,
    now: DateTime<Utc>,
    samples: Vec<MetricSample>,
    checks: Vec<(Check, CheckStatus)>,
    lock_held: bool,
}

impl Run<'_> {
    fn push(&mut self, def: &'static MetricDef, label_values: Vec<String>, value: f64) {
        self.samples
            .push(MetricSample::new(def, label_values, value, self.now));
    }

    fn push_repo(&mut self, def: &'static MetricDef, value: f64) {
        self.push(def, vec![self.repository.to_string()], value);
    }

    fn record(&mut self, check: Check, status: CheckStatus) {
        match self.checks.iter_mut().find(|(c, _)| *c == check) {
            Some(entry) => entry.1 = status,
            None => self.checks.push((check, status)),
        }
    }

    fn fail(&mut self, check: Check, failure: &CommandFailure) {
        if failure.kind == FailureKind::LockHeld {
            self.lock_held = true;
        }
        self.record(check, CheckStatus::Failed(failure.kind));
    }
}

impl Collector {
    pub fn new(
        repository: Arc<RepositoryConfig>,
        runner: Arc<dyn CommandRunner>,
        options: CollectorOptions,
    ) -> Self {
        Self {
            repository,
            runner,
            options,
            stats_cache: HashMap::new(),
            known_groups: BTreeSet::new(),
            lock_streak: 0,
            last_success: None,
        }
    }

    pub fn repository(&self) -> &RepositoryConfig {
        &self.repository
    }

    /// Run every enabled check now.
    pub async fn collect(&mut self) -> CollectionOutcome {
        self.collect_at(Utc::now()).await
    }

    /// Run every enabled check, computing ages relative to `now`.
    pub async fn collect_at(&mut self, now: DateTime<Utc>) -> CollectionOutcome {
        let started = Instant::now();
        let repository = Arc::clone(&self.repository);
        info!("Collecting repository {}", repository.id);

        let mut run = Run {
            repository: &repository.id,
            now,
            samples: Vec::new(),
            checks: Vec::new(),
            lock_held: false,
        };

        let snapshots = self.collect_snapshots(&mut run).await;

        if repository.stats {
            if run.lock_held {
                run.record(Check::Stats, CheckStatus::Skipped);
            } else {
                self.collect_stats(&mut run, snapshots.as_deref()).await;
            }
        }

        if repository.snapshot_stats {
            match &snapshots {
                Some(snapshots) if !run.lock_held => {
                    self.collect_snapshot_stats(&mut run, snapshots).await
                }
                Some(_) => run.record(Check::SnapshotStats, CheckStatus::Skipped),
                // Nothing to attribute stats to
                None => {}
            }
        }

        if repository.locks {
            self.collect_locks(&mut run).await;
        }

        if repository.check {
            if run.lock_held {
                debug!("Skipping integrity check of locked {}", repository.id);
                run.record(Check::Integrity, CheckStatus::Skipped);
            } else {
                self.collect_integrity(&mut run).await;
            }
        }

        self.finish(run, started)
    }

    async fn execute(&self, command: Command, timeout: Duration) -> Result<Payload, CommandFailure> {
        self.runner.run(&self.repository, &command, timeout).await
    }

    async fn collect_snapshots(&mut self, run: &mut Run<'_>) -> Option<Vec<SnapshotInfo>> {
        // An existing repository without backups lists `[]`; NotFound means
        // the repository itself is missing
        let result = self
            .execute(Command::ListSnapshots, self.options.timeout)
            .await
            .and_then(|p| p.into_snapshots());

        match result {
            Ok(snapshots) => {
                self.snapshot_samples(run, &snapshots);
                run.record(Check::Snapshots, CheckStatus::Ok);
                Some(snapshots)
            }
            Err(e) => {
                warn!("Snapshots check failed for {}: {}", self.repository.id, e);
                run.fail(Check::Snapshots, &e);
                None
            }
        }
    }

    fn snapshot_samples(&mut self, run: &mut Run<'_>, snapshots: &[SnapshotInfo]) {
        run.push_repo(&metrics::SNAPSHOTS_TOTAL, snapshots.len() as f64);

        let groups = group_snapshots(snapshots);
        debug!(
            "Found {} snapshots in {} groups for {}",
            snapshots.len(),
            groups.len(),
            self.repository.id
        );

        for (key, group) in &groups {
            let labels = key.label_values(&self.repository.id, self.options.include_paths);
            let latest = group.latest;
            let summary = latest.summary.clone().unwrap_or_default();
            let age = (run.now - latest.time).num_milliseconds().max(0) as f64 / 1000.0;

            run.push(&metrics::BACKUP_TIMESTAMP, labels.clone(), latest.time.timestamp() as f64);
            run.push(&metrics::BACKUP_AGE, labels.clone(), age);
            run.push(&metrics::BACKUP_SNAPSHOTS_TOTAL, labels.clone(), group.count as f64);
            run.push(&metrics::BACKUP_FILES_NEW, labels.clone(), summary.files_new as f64);
            run.push(&metrics::BACKUP_FILES_CHANGED, labels.clone(), summary.files_changed as f64);
            run.push(&metrics::BACKUP_FILES_UNMODIFIED, labels.clone(), summary.files_unmodified as f64);
            run.push(&metrics::BACKUP_FILES_PROCESSED, labels.clone(), latest.file_count() as f64);
            run.push(&metrics::BACKUP_BYTES_PROCESSED, labels.clone(), latest.size_bytes() as f64);
            run.push(&metrics::BACKUP_BYTES_ADDED, labels.clone(), summary.data_added as f64);
            run.push(
                &metrics::BACKUP_DURATION,
                labels,
                summary.duration().map_or(0.0, |d| d.as_secs_f64()),
            );
        }

        for missing in self.known_groups.iter().filter(|k| !groups.contains_key(*k)) {
            run.push(
                &metrics::BACKUP_MISSING,
                missing.label_values(&self.repository.id, self.options.include_paths),
                1.0,
            );
        }
        self.known_groups.extend(groups.into_keys());
    }

    async fn collect_stats(&mut self, run: &mut Run<'_>, snapshots: Option<&[SnapshotInfo]>) {
        let mode = self.repository.stats_mode;
        let target = match self.repository.stats_scope {
            StatsScope::Repository => StatsTarget::Repository,
            StatsScope::Latest => {
                if snapshots.is_some_and(|s| s.is_empty()) {
                    // `stats latest` has nothing to look at
                    run.record(Check::Stats, CheckStatus::Ok);
                    return;
                }
                StatsTarget::Latest
            }
        };

        let result = match self
            .execute(Command::ComputeStats { mode, target }, self.options.timeout)
            .await
        {
            Ok(payload) => payload.into_stats().map(Some),
            // `stats latest` on a repository that has no matching snapshot
            Err(e)
                if e.kind == FailureKind::NotFound
                    && self.repository.stats_scope == StatsScope::Latest
                    && snapshots.is_some() =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(stats) => {
                if let Some(stats) = stats {
                    stats_samples(run, mode, &stats);
                }
                run.record(Check::Stats, CheckStatus::Ok);
            }
            Err(e) => {
                warn!("Stats check failed for {}: {}", self.repository.id, e);
                run.fail(Check::Stats, &e);
            }
        }
    }

    async fn collect_snapshot_stats(&mut self, run: &mut Run<'_>, snapshots: &[SnapshotInfo]) {
        let groups = group_snapshots(snapshots);
        let mut status = CheckStatus::Ok;

        for (key, group) in &groups {
            let id = &group.latest.id;
            let stats = match self.stats_cache.get(id) {
                Some(stats) => stats.clone(),
                None => {
                    let command = Command::ComputeStats {
                        mode: StatsMode::RestoreSize,
                        target: StatsTarget::Snapshot(id.clone()),
                    };
                    match self
                        .execute(command, self.options.timeout)
                        .await
                        .and_then(|p| p.into_stats())
                    {
                        Ok(stats) => {
                            self.stats_cache.insert(id.clone(), stats.clone());
                            stats
                        }
                        Err(e) => {
                            warn!(
                                "Stats of snapshot {} failed for {}: {}",
                                id, self.repository.id, e
                            );
                            status = CheckStatus::Failed(e.kind);
                            if e.kind == FailureKind::LockHeld {
                                run.lock_held = true;
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            let labels = key.label_values(&self.repository.id, self.options.include_paths);
            run.push(&metrics::BACKUP_SIZE_BYTES, labels.clone(), stats.total_size as f64);
            if let Some(files) = stats.total_file_count {
                run.push(&metrics::BACKUP_FILES_TOTAL, labels, files as f64);
            }
        }

        // Snapshot ids are immutable, so only entries for superseded snapshots go stale
        let latest: BTreeSet<&str> = groups.values().map(|g| g.latest.id.as_str()).collect();
        self.stats_cache.retain(|id, _| latest.contains(id.as_str()));

        run.record(Check::SnapshotStats, status);
    }

    async fn collect_locks(&mut self, run: &mut Run<'_>) {
        let result = self
            .execute(Command::QueryLock, self.options.timeout)
            .await
            .and_then(|p| p.into_locks());

        match result {
            Ok(state) => {
                lock_samples(run, &state);
                if state.exclusive {
                    run.lock_held = true;
                }
                run.record(Check::Locks, CheckStatus::Ok);
            }
            Err(e) => {
                warn!("Lock query failed for {}: {}", self.repository.id, e);
                run.fail(Check::Locks, &e);
            }
        }
    }

    async fn collect_integrity(&mut self, run: &mut Run<'_>) {
        let result = self
            .execute(Command::CheckIntegrity, self.options.check_timeout)
            .await
            .and_then(|p| p.into_integrity());

        match result {
            Ok(IntegrityReport { errors_found }) => {
                run.push_repo(
                    &metrics::INTEGRITY_ERRORS_FOUND,
                    if errors_found { 1.0 } else { 0.0 },
                );
                let status = if errors_found {
                    CheckStatus::Unhealthy
                } else {
                    CheckStatus::Ok
                };
                run.record(Check::Integrity, status);
            }
            Err(e) => {
                warn!("Integrity check failed for {}: {}", self.repository.id, e);
                run.fail(Check::Integrity, &e);
            }
        }
    }

    /// Add run status samples and build the outcome.
    fn finish(&mut self, mut run: Run<'_>, started: Instant) -> CollectionOutcome {
        let duration = started.elapsed();
        let repository = run.repository.to_string();

        self.lock_streak = if run.lock_held {
            self.lock_streak.saturating_add(1)
        } else {
            0
        };

        let success = all_ok(&run.checks, run.lock_held);
        if success {
            self.last_success = Some(run.now);
        }

        self.push_status(&mut run, success, duration);
        run.push_repo(&metrics::LOCK_HELD, if run.lock_held { 1.0 } else { 0.0 });
        run.push_repo(&metrics::LOCK_HELD_CONSECUTIVE_RUNS, self.lock_streak as f64);
        if let Some(threshold) = self.options.lock_escalation_threshold {
            let escalated = self.lock_streak >= threshold;
            run.push_repo(&metrics::LOCK_ESCALATED, if escalated { 1.0 } else { 0.0 });
        }

        let checks = run.checks.clone();
        for (check, status) in &checks {
            let value = match status {
                CheckStatus::Ok => 1.0,
                CheckStatus::Unhealthy | CheckStatus::Failed(_) => 0.0,
                CheckStatus::Skipped => continue,
            };
            run.push(
                &metrics::CHECK_SUCCESS,
                vec![repository.clone(), check.label().to_string()],
                value,
            );
            if let CheckStatus::Failed(kind) = status {
                run.push(
                    &metrics::LAST_ERROR_INFO,
                    vec![
                        repository.clone(),
                        check.label().to_string(),
                        kind.label().to_string(),
                    ],
                    1.0,
                );
            }
        }

        info!(
            "Collected repository {} in {:.2}s (success: {})",
            repository,
            duration.as_secs_f64(),
            success
        );

        CollectionOutcome {
            repository,
            attempted_at: run.now,
            last_success: self.last_success,
            duration,
            checks,
            lock_held: run.lock_held,
            samples: run.samples,
        }
    }

    fn push_status(&self, run: &mut Run<'_>, success: bool, duration: Duration) {
        run.push_repo(&metrics::NEVER_COLLECTED, 0.0);
        run.push_repo(&metrics::COLLECTION_SUCCESS, if success { 1.0 } else { 0.0 });
        run.push_repo(&metrics::LAST_ATTEMPT_TIMESTAMP, run.now.timestamp() as f64);
        if let Some(last_success) = self.last_success {
            run.push_repo(&metrics::LAST_SUCCESS_TIMESTAMP, last_success.timestamp() as f64);
        }
        run.push_repo(&metrics::COLLECTION_DURATION, duration.as_secs_f64());
        run.push_repo(&metrics::COLLECTION_TIMESTAMP, run.now.timestamp() as f64);
    }

    /// Outcome for a run that ended without producing results.
    ///
    /// Carries only the failed run status; published check data is kept.
    pub fn aborted(&self, attempted_at: DateTime<Utc>, duration: Duration) -> CollectionOutcome {
        let repository = Arc::clone(&self.repository);
        let mut run = Run {
            repository: &repository.id,
            now: attempted_at,
            samples: Vec::new(),
            checks: Vec::new(),
            lock_held: false,
        };
        self.push_status(&mut run, false, duration);

        CollectionOutcome {
            repository: repository.id.clone(),
            attempted_at,
            last_success: self.last_success,
            duration,
            checks: Vec::new(),
            lock_held: false,
            samples: run.samples,
        }
    }
}

fn stats_samples(run: &mut Run<'_>, mode: StatsMode, stats: &RepositoryStats) {
    let labels = vec![run.repository.to_string(), mode.as_str().to_string()];
    run.push(&metrics::REPOSITORY_SIZE, labels.clone(), stats.total_size as f64);
    if let Some(size) = stats.total_uncompressed_size {
        run.push(&metrics::REPOSITORY_UNCOMPRESSED_SIZE, labels.clone(), size as f64);
    }
    if let Some(files) = stats.total_file_count {
        run.push(&metrics::REPOSITORY_FILES, labels.clone(), files as f64);
    }
    if let Some(blobs) = stats.total_blob_count {
        run.push(&metrics::REPOSITORY_BLOBS, labels.clone(), blobs as f64);
    }
    if let Some(ratio) = stats.compression_ratio {
        run.push(&metrics::REPOSITORY_COMPRESSION_RATIO, labels, ratio);
    }
}

fn lock_samples(run: &mut Run<'_>, state: &LockState) {
    run.push_repo(&metrics::LOCKS_TOTAL, state.lock_count as f64);
    if let Some(since) = state.since {
        run.push_repo(&metrics::LOCK_OLDEST_TIMESTAMP, since.timestamp() as f64);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Runner that answers from a script and records every command.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        snapshots: Mutex<Option<Result<Payload, CommandFailure>>>,
        stats: Mutex<Option<Result<Payload, CommandFailure>>>,
        locks: Mutex<Option<Result<Payload, CommandFailure>>>,
        integrity: Mutex<Option<Result<Payload, CommandFailure>>>,
        pub(crate) calls: Mutex<Vec<Command>>,
    }

    impl ScriptedRunner {
        pub(crate) fn with_snapshots(self, r: Result<Vec<SnapshotInfo>, CommandFailure>) -> Self {
            *self.snapshots.lock().unwrap() = Some(r.map(Payload::Snapshots));
            self
        }

        pub(crate) fn with_stats(self, r: Result<RepositoryStats, CommandFailure>) -> Self {
            *self.stats.lock().unwrap() = Some(r.map(Payload::Stats));
            self
        }

        pub(crate) fn with_locks(self, r: Result<LockState, CommandFailure>) -> Self {
            *self.locks.lock().unwrap() = Some(r.map(Payload::Locks));
            self
        }

        pub(crate) fn with_integrity(self, r: Result<IntegrityReport, CommandFailure>) -> Self {
            *self.integrity.lock().unwrap() = Some(r.map(Payload::Integrity));
            self
        }

        pub(crate) fn count(&self, pred: impl Fn(&Command) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _repository: &RepositoryConfig,
            command: &Command,
            _timeout: Duration,
        ) -> Result<Payload, CommandFailure> {
            self.calls.lock().unwrap().push(command.clone());
            let slot = match command {
                Command::ListSnapshots => &self.snapshots,
                Command::ComputeStats { .. } => &self.stats,
                Command::QueryLock => &self.locks,
                Command::CheckIntegrity => &self.integrity,
            };
            slot.lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(CommandFailure::new(FailureKind::Unknown, "not scripted")))
        }
    }

    pub(crate) fn snapshot(id: &str, host: &str, tags: &[&str], time: DateTime<Utc>) -> SnapshotInfo {
        SnapshotInfo {
            id: id.to_string(),
            time,
            hostname: host.to_string(),
            username: "root".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            paths: vec!["/srv".to_string()],
            program_version: Some("restic 0.17.3".to_string()),
            summary: None,
        }
    }

    fn stats(total_size: u64) -> RepositoryStats {
        RepositoryStats {
            total_size,
            total_file_count: Some(10),
            total_uncompressed_size: None,
            compression_ratio: None,
            total_blob_count: Some(5),
        }
    }

    fn collector(repo: RepositoryConfig, runner: Arc<ScriptedRunner>) -> Collector {
        Collector::new(
            Arc::new(repo),
            runner,
            CollectorOptions {
                timeout: Duration::from_secs(5),
                check_timeout: Duration::from_secs(60),
                include_paths: false,
                lock_escalation_threshold: Some(2),
            },
        )
    }

    fn value(outcome: &CollectionOutcome, def: &MetricDef, label: Option<(&str, &str)>) -> Option<f64> {
        outcome
            .samples_of(def)
            .find(|s| label.map_or(true, |(k, v)| s.label(k) == Some(v)))
            .map(|s| s.value)
    }

    fn fully_enabled(id: &str) -> RepositoryConfig {
        let mut repo = RepositoryConfig::new(id, format!("/srv/{}", id), "/etc/pw");
        repo.check = true;
        repo
    }

    #[tokio::test]
    async fn test_alpine_daily_snapshot_staleness() {
        let now = Utc::now();
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![snapshot(
                    "a1",
                    "alpine",
                    &["daily"],
                    now - chrono::Duration::hours(2),
                )]))
                .with_stats(Ok(stats(2048)))
                .with_locks(Ok(LockState::default()))
                .with_integrity(Ok(IntegrityReport { errors_found: false })),
        );
        let mut c = collector(fully_enabled("alpine"), runner);

        let outcome = c.collect_at(now).await;

        assert!(outcome.success());
        let age = value(&outcome, &metrics::BACKUP_AGE, Some(("tag", "daily"))).unwrap();
        assert!((age - 7200.0).abs() < 1.0, "age was {}", age);
        assert_eq!(
            value(&outcome, &metrics::CHECK_SUCCESS, Some(("check", "snapshots"))),
            Some(1.0)
        );
        assert_eq!(value(&outcome, &metrics::SNAPSHOTS_TOTAL, None), Some(1.0));
        assert_eq!(value(&outcome, &metrics::BACKUP_SIZE_BYTES, None), Some(2048.0));
        assert_eq!(value(&outcome, &metrics::INTEGRITY_ERRORS_FOUND, None), Some(0.0));
        assert_eq!(value(&outcome, &metrics::NEVER_COLLECTED, None), Some(0.0));
        assert_eq!(outcome.last_success, Some(now));
    }

    #[tokio::test]
    async fn test_samples_share_one_timestamp() {
        let now = Utc::now();
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![
                    snapshot("a1", "alpine", &["daily"], now - chrono::Duration::hours(30)),
                    snapshot("a2", "alpine", &["daily"], now - chrono::Duration::hours(6)),
                    snapshot("b1", "beta", &[], now - chrono::Duration::hours(1)),
                ]))
                .with_stats(Ok(stats(100)))
                .with_locks(Ok(LockState::default())),
        );
        let mut c = collector(RepositoryConfig::new("alpine", "/srv/a", "/pw"), runner);

        let outcome = c.collect_at(now).await;
        assert!(outcome.samples.iter().all(|s| s.timestamp == now));
        assert_eq!(outcome.samples_of(&metrics::BACKUP_AGE).count(), 2);
        assert_eq!(
            value(&outcome, &metrics::BACKUP_SNAPSHOTS_TOTAL, Some(("host", "alpine"))),
            Some(2.0)
        );
        let age = value(&outcome, &metrics::BACKUP_AGE, Some(("host", "alpine"))).unwrap();
        assert!((age - 6.0 * 3600.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_broken_repository_lock_held() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Err(CommandFailure::new(
                    FailureKind::LockHeld,
                    "repository is already locked exclusively",
                )))
                .with_stats(Ok(stats(1)))
                .with_locks(Ok(LockState {
                    lock_count: 1,
                    exclusive: true,
                    since: None,
                }))
                .with_integrity(Ok(IntegrityReport { errors_found: false })),
        );
        let mut c = collector(fully_enabled("broken"), Arc::clone(&runner));

        let outcome = c.collect().await;

        assert!(!outcome.success());
        assert!(outcome.lock_held);
        assert_eq!(value(&outcome, &metrics::LOCK_HELD, None), Some(1.0));
        assert_eq!(value(&outcome, &metrics::LOCKS_TOTAL, None), Some(1.0));
        assert_eq!(
            value(&outcome, &metrics::CHECK_SUCCESS, Some(("check", "snapshots"))),
            Some(0.0)
        );
        assert_eq!(
            value(&outcome, &metrics::LAST_ERROR_INFO, Some(("kind", "lock_held"))),
            Some(1.0)
        );
        assert_eq!(
            value(&outcome, &metrics::CHECK_SUCCESS, Some(("check", "locks"))),
            Some(1.0)
        );
        // Checks that would conflict with the lock are skipped
        assert_eq!(outcome.status(Check::Stats), Some(CheckStatus::Skipped));
        assert_eq!(outcome.status(Check::Integrity), Some(CheckStatus::Skipped));
        assert!(value(&outcome, &metrics::CHECK_SUCCESS, Some(("check", "integrity"))).is_none());
        assert!(value(&outcome, &metrics::INTEGRITY_ERRORS_FOUND, None).is_none());
        assert_eq!(runner.count(|c| matches!(c, Command::CheckIntegrity)), 0);
        assert_eq!(runner.count(|c| matches!(c, Command::ComputeStats { .. })), 0);
    }

    #[tokio::test]
    async fn test_lock_escalation_after_threshold() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![]))
                .with_stats(Ok(stats(0)))
                .with_locks(Ok(LockState {
                    lock_count: 1,
                    exclusive: true,
                    since: None,
                })),
        );
        let mut c = collector(RepositoryConfig::new("broken", "/srv/b", "/pw"), runner);

        let first = c.collect().await;
        assert_eq!(value(&first, &metrics::LOCK_HELD_CONSECUTIVE_RUNS, None), Some(1.0));
        assert_eq!(value(&first, &metrics::LOCK_ESCALATED, None), Some(0.0));

        let second = c.collect().await;
        assert_eq!(value(&second, &metrics::LOCK_HELD_CONSECUTIVE_RUNS, None), Some(2.0));
        assert_eq!(value(&second, &metrics::LOCK_ESCALATED, None), Some(1.0));
    }

    #[tokio::test]
    async fn test_empty_repository() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![]))
                .with_stats(Ok(stats(0)))
                .with_locks(Ok(LockState::default())),
        );
        let mut c = collector(RepositoryConfig::new("empty", "/srv/e", "/pw"), runner);

        let outcome = c.collect().await;

        assert!(outcome.success());
        assert_eq!(
            value(&outcome, &metrics::CHECK_SUCCESS, Some(("check", "snapshots"))),
            Some(1.0)
        );
        assert_eq!(value(&outcome, &metrics::SNAPSHOTS_TOTAL, None), Some(0.0));
        assert_eq!(outcome.samples_of(&metrics::BACKUP_AGE).count(), 0);
        assert_eq!(outcome.samples_of(&metrics::BACKUP_MISSING).count(), 0);
    }

    #[tokio::test]
    async fn test_missing_repository_is_a_failure() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Err(CommandFailure::new(
                    FailureKind::NotFound,
                    "Is there a repository at the following location? Exit code: 10",
                )))
                .with_stats(Err(CommandFailure::new(FailureKind::NotFound, "no repository")))
                .with_locks(Ok(LockState::default())),
        );
        let mut c = collector(RepositoryConfig::new("typo", "/srv/typo", "/pw"), runner);

        let outcome = c.collect().await;
        assert!(!outcome.success());
        assert_eq!(
            outcome.status(Check::Snapshots),
            Some(CheckStatus::Failed(FailureKind::NotFound))
        );
        assert_eq!(
            outcome.status(Check::Stats),
            Some(CheckStatus::Failed(FailureKind::NotFound))
        );
        assert_eq!(
            value(&outcome, &metrics::CHECK_SUCCESS, Some(("check", "snapshots"))),
            Some(0.0)
        );
        assert_eq!(
            value(&outcome, &metrics::LAST_ERROR_INFO, Some(("kind", "not_found"))),
            Some(1.0)
        );
        assert!(value(&outcome, &metrics::SNAPSHOTS_TOTAL, None).is_none());
    }

    #[tokio::test]
    async fn test_latest_stats_without_match_is_not_a_failure() {
        let now = Utc::now();
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![snapshot("a1", "alpine", &["daily"], now)]))
                .with_stats(Err(CommandFailure::new(FailureKind::NotFound, "no snapshot found")))
                .with_locks(Ok(LockState::default())),
        );
        let mut repo = RepositoryConfig::new("alpine", "/srv/a", "/pw");
        repo.snapshot_stats = false;
        repo.stats_scope = StatsScope::Latest;
        let mut c = collector(repo, runner);

        let outcome = c.collect_at(now).await;
        assert_eq!(outcome.status(Check::Stats), Some(CheckStatus::Ok));
        assert_eq!(outcome.samples_of(&metrics::REPOSITORY_SIZE).count(), 0);
    }

    #[tokio::test]
    async fn test_sources_with_different_paths_stay_separate() {
        let now = Utc::now();
        let mut etc = snapshot("e1", "web01", &[], now - chrono::Duration::days(10));
        etc.paths = vec!["/etc".to_string()];
        let mut home = snapshot("h1", "web01", &[], now - chrono::Duration::hours(1));
        home.paths = vec!["/home".to_string()];
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![etc, home]))
                .with_stats(Ok(stats(1)))
                .with_locks(Ok(LockState::default())),
        );
        let mut c = collector(RepositoryConfig::new("web", "/srv/w", "/pw"), runner);

        let outcome = c.collect_at(now).await;

        let mut ages: Vec<f64> = outcome.samples_of(&metrics::BACKUP_AGE).map(|s| s.value).collect();
        ages.sort_by(f64::total_cmp);
        assert_eq!(ages, vec![3600.0, 10.0 * 86400.0]);

        let hashes: BTreeSet<&str> = outcome
            .samples_of(&metrics::BACKUP_AGE)
            .filter_map(|s| s.label("snapshot_hash"))
            .collect();
        assert_eq!(hashes.len(), 2);
        assert!(hashes.iter().all(|h| h.len() == 64));
        // Paths are hidden unless include_paths is set
        assert!(outcome
            .samples_of(&metrics::BACKUP_AGE)
            .all(|s| s.label("paths") == Some("")));
    }

    #[tokio::test]
    async fn test_stats_failure_keeps_snapshot_metrics() {
        let now = Utc::now();
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![snapshot("a1", "alpine", &["daily"], now)]))
                .with_stats(Err(CommandFailure::new(FailureKind::Timeout, "timed out")))
                .with_locks(Ok(LockState::default())),
        );
        let mut c = collector(RepositoryConfig::new("alpine", "/srv/a", "/pw"), runner);

        let outcome = c.collect_at(now).await;

        assert!(!outcome.success());
        assert_eq!(
            value(&outcome, &metrics::CHECK_SUCCESS, Some(("check", "stats"))),
            Some(0.0)
        );
        assert_eq!(
            value(&outcome, &metrics::LAST_ERROR_INFO, Some(("check", "stats"))),
            Some(1.0)
        );
        let error = outcome
            .samples_of(&metrics::LAST_ERROR_INFO)
            .find(|s| s.label("check") == Some("stats"))
            .unwrap();
        assert_eq!(error.label("kind"), Some("timeout"));
        assert_eq!(
            value(&outcome, &metrics::CHECK_SUCCESS, Some(("check", "snapshots"))),
            Some(1.0)
        );
        assert!(value(&outcome, &metrics::BACKUP_AGE, None).is_some());
    }

    #[tokio::test]
    async fn test_snapshot_stats_are_cached() {
        let now = Utc::now();
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![snapshot("a1", "alpine", &["daily"], now)]))
                .with_stats(Ok(stats(10)))
                .with_locks(Ok(LockState::default())),
        );
        let mut repo = RepositoryConfig::new("alpine", "/srv/a", "/pw");
        repo.stats = false;
        let mut c = collector(repo, Arc::clone(&runner));

        c.collect_at(now).await;
        c.collect_at(now).await;

        let snapshot_stats = |c: &Command| {
            matches!(
                c,
                Command::ComputeStats {
                    target: StatsTarget::Snapshot(_),
                    ..
                }
            )
        };
        assert_eq!(runner.count(snapshot_stats), 1);
    }

    #[tokio::test]
    async fn test_vanished_group_reported_missing() {
        let now = Utc::now();
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![
                    snapshot("a1", "alpine", &["daily"], now),
                    snapshot("b1", "beta", &["daily"], now),
                ]))
                .with_stats(Ok(stats(1)))
                .with_locks(Ok(LockState::default())),
        );
        let mut c = collector(RepositoryConfig::new("alpine", "/srv/a", "/pw"), Arc::clone(&runner));
        let first = c.collect_at(now).await;
        assert_eq!(first.samples_of(&metrics::BACKUP_MISSING).count(), 0);

        *runner.snapshots.lock().unwrap() = Some(Ok(Payload::Snapshots(vec![snapshot(
            "a2", "alpine", &["daily"], now,
        )])));
        let second = c.collect_at(now).await;

        let missing: Vec<_> = second.samples_of(&metrics::BACKUP_MISSING).collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].label("host"), Some("beta"));
        assert_eq!(missing[0].value, 1.0);
        assert!(second
            .samples_of(&metrics::BACKUP_AGE)
            .all(|s| s.label("host") == Some("alpine")));
    }

    #[tokio::test]
    async fn test_integrity_errors_reported() {
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![]))
                .with_stats(Ok(stats(1)))
                .with_locks(Ok(LockState::default()))
                .with_integrity(Ok(IntegrityReport { errors_found: true })),
        );
        let mut c = collector(fully_enabled("alpine"), runner);

        let outcome = c.collect().await;
        assert!(!outcome.success());
        assert_eq!(outcome.status(Check::Integrity), Some(CheckStatus::Unhealthy));
        assert_eq!(value(&outcome, &metrics::INTEGRITY_ERRORS_FOUND, None), Some(1.0));
        assert_eq!(
            value(&outcome, &metrics::CHECK_SUCCESS, Some(("check", "integrity"))),
            Some(0.0)
        );
        assert_eq!(outcome.samples_of(&metrics::LAST_ERROR_INFO).count(), 0);
    }

    #[tokio::test]
    async fn test_collection_is_idempotent() {
        let now = Utc::now();
        let runner = Arc::new(
            ScriptedRunner::default()
                .with_snapshots(Ok(vec![
                    snapshot("a1", "alpine", &["daily"], now - chrono::Duration::minutes(5)),
                    snapshot("b1", "beta", &["weekly", "db"], now - chrono::Duration::days(3)),
                ]))
                .with_stats(Ok(stats(4096)))
                .with_locks(Ok(LockState::default())),
        );
        let mut c = collector(RepositoryConfig::new("alpine", "/srv/a", "/pw"), runner);

        let strip = |o: CollectionOutcome| -> Vec<(String, Vec<String>, f64)> {
            o.samples
                .into_iter()
                .filter(|s| s.def != &metrics::COLLECTION_DURATION)
                .map(|s| (s.name().to_string(), s.label_values, s.value))
                .collect()
        };

        let first = strip(c.collect_at(now).await);
        let second = strip(c.collect_at(now).await);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_all_commands_failing_never_panics() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut c = collector(fully_enabled("down"), runner);

        let outcome = c.collect().await;
        assert!(!outcome.success());
        assert_eq!(outcome.last_success, None);
        assert_eq!(value(&outcome, &metrics::COLLECTION_SUCCESS, None), Some(0.0));
        assert!(value(&outcome, &metrics::LAST_SUCCESS_TIMESTAMP, None).is_none());
        assert_eq!(outcome.samples_of(&metrics::LAST_ERROR_INFO).count(), 4);
    }
}
