//! restic command runner.
//!
//! This module runs the read-only inspection commands of the `restic` CLI
//! for one repository, decodes their JSON output into typed values and
//! classifies failures so the collector can decide how to report them.

use crate::config::{RepositoryConfig, StatsMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as ProcessCommand;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lock files inspected in detail per query; the remainder are only counted.
const MAX_LOCK_DETAILS: usize = 16;

/// Longest stderr excerpt kept in a failure message.
const MAX_MESSAGE_LEN: usize = 512;

/// What `restic stats` is pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsTarget {
    Repository,
    Latest,
    Snapshot(String),
}

/// Logical inspection command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListSnapshots,
    ComputeStats { mode: StatsMode, target: StatsTarget },
    QueryLock,
    CheckIntegrity,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ListSnapshots => write!(f, "snapshots"),
            Command::ComputeStats { mode, target } => match target {
                StatsTarget::Repository => write!(f, "stats --mode {}", mode.as_str()),
                StatsTarget::Latest => write!(f, "stats --mode {} latest", mode.as_str()),
                StatsTarget::Snapshot(id) => write!(f, "stats --mode {} {}", mode.as_str(), id),
            },
            Command::QueryLock => write!(f, "list locks"),
            Command::CheckIntegrity => write!(f, "check"),
        }
    }
}

/// Classification of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Credentials or storage access rejected
    AuthError,
    /// Repository exclusively locked by another process
    LockHeld,
    Timeout,
    /// Output did not have the expected shape
    ParseError,
    /// Repository or snapshot does not exist (yet)
    NotFound,
    Unknown,
}

impl FailureKind {
    /// Value of the `kind` label.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::AuthError => "auth_error",
            FailureKind::LockHeld => "lock_held",
            FailureKind::Timeout => "timeout",
            FailureKind::ParseError => "parse_error",
            FailureKind::NotFound => "not_found",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error returned by a [`CommandRunner`].
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CommandFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CommandFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Summary restic stores with each snapshot (restic >= 0.17).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SnapshotSummary {
    #[serde(default)]
    pub backup_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backup_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files_new: u64,
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub files_unmodified: u64,
    #[serde(default)]
    pub total_files_processed: u64,
    #[serde(default)]
    pub total_bytes_processed: u64,
    #[serde(default)]
    pub data_added: u64,
}

impl SnapshotSummary {
    /// Wall-clock duration of the backup, when both ends are recorded.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.backup_start?, self.backup_end?);
        (end - start).to_std().ok()
    }
}

/// One entry of `restic snapshots --json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub time: DateTime<Utc>,
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub program_version: Option<String>,
    #[serde(default)]
    pub summary: Option<SnapshotSummary>,
}

impl SnapshotInfo {
    /// Bytes read by the backup that produced this snapshot.
    pub fn size_bytes(&self) -> u64 {
        self.summary.as_ref().map_or(0, |s| s.total_bytes_processed)
    }

    /// Files processed by the backup that produced this snapshot.
    pub fn file_count(&self) -> u64 {
        self.summary.as_ref().map_or(0, |s| s.total_files_processed)
    }
}

/// Output of `restic stats --json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepositoryStats {
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: Option<u64>,
    #[serde(default)]
    pub total_uncompressed_size: Option<u64>,
    #[serde(default)]
    pub compression_ratio: Option<f64>,
    #[serde(default)]
    pub total_blob_count: Option<u64>,
}

/// Output of `restic cat lock <id>`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LockInfo {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub exclusive: bool,
}

/// Locks present in a repository.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockState {
    pub lock_count: usize,
    /// An exclusive lock is among the inspected locks
    pub exclusive: bool,
    /// Creation time of the oldest inspected lock
    pub since: Option<DateTime<Utc>>,
}

impl LockState {
    fn from_locks(lock_count: usize, locks: &[LockInfo]) -> Self {
        Self {
            lock_count,
            exclusive: locks.iter().any(|l| l.exclusive),
            since: locks.iter().map(|l| l.time).min(),
        }
    }
}

/// Result of `restic check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityReport {
    pub errors_found: bool,
}

/// Decoded output of a successful command.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Snapshots(Vec<SnapshotInfo>),
    Stats(RepositoryStats),
    Locks(LockState),
    Integrity(IntegrityReport),
}

fn unexpected(expected: &str, got: &Payload) -> CommandFailure {
    CommandFailure::new(
        FailureKind::ParseError,
        format!("expected {} payload, got {:?}", expected, got),
    )
}

impl Payload {
    pub fn into_snapshots(self) -> Result<Vec<SnapshotInfo>, CommandFailure> {
        match self {
            Payload::Snapshots(s) => Ok(s),
            other => Err(unexpected("snapshots", &other)),
        }
    }

    pub fn into_stats(self) -> Result<RepositoryStats, CommandFailure> {
        match self {
            Payload::Stats(s) => Ok(s),
            other => Err(unexpected("stats", &other)),
        }
    }

    pub fn into_locks(self) -> Result<LockState, CommandFailure> {
        match self {
            Payload::Locks(l) => Ok(l),
            other => Err(unexpected("locks", &other)),
        }
    }

    pub fn into_integrity(self) -> Result<IntegrityReport, CommandFailure> {
        match self {
            Payload::Integrity(r) => Ok(r),
            other => Err(unexpected("integrity", &other)),
        }
    }
}

/// Runs one inspection command against one repository.
///
/// Implementations perform no retries.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        repository: &RepositoryConfig,
        command: &Command,
        timeout: Duration,
    ) -> Result<Payload, CommandFailure>;
}

/// Classify a non-zero exit from its status code and stderr.
///
/// restic >= 0.17 uses dedicated exit codes (10: no repository, 11: lock
/// failed, 12: wrong password); older versions are recognised by message.
pub fn classify(exit_code: Option<i32>, stderr: &str) -> FailureKind {
    match exit_code {
        Some(12) => return FailureKind::AuthError,
        Some(11) => return FailureKind::LockHeld,
        Some(10) => return FailureKind::NotFound,
        _ => {}
    }

    let stderr = stderr.to_ascii_lowercase();

    if contains_any(&stderr, &[
        "already locked",
        "unable to create lock",
        "repository is locked",
    ]) {
        FailureKind::LockHeld
    } else if contains_any(&stderr, &[
        "wrong password",
        "no key found",
        "permission denied",
        "access denied",
        "forbidden",
        "unauthorized",
    ]) {
        FailureKind::AuthError
    } else if contains_any(&stderr, &[
        "does not exist",
        "is there a repository at",
        "no snapshot found",
        "no matching",
    ]) {
        FailureKind::NotFound
    } else {
        FailureKind::Unknown
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Parse `restic snapshots --json`.
pub fn parse_snapshots(stdout: &[u8]) -> Result<Vec<SnapshotInfo>, CommandFailure> {
    // restic prints nothing rather than `[]` for some backends
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(stdout).map_err(|e| {
        CommandFailure::new(
            FailureKind::ParseError,
            format!("failed to parse snapshots: {}", e),
        )
    })
}

/// Parse `restic stats --json`.
pub fn parse_stats(stdout: &[u8]) -> Result<RepositoryStats, CommandFailure> {
    serde_json::from_slice(stdout).map_err(|e| {
        CommandFailure::new(
            FailureKind::ParseError,
            format!("failed to parse stats: {}", e),
        )
    })
}

/// Parse `restic list locks`: one lowercase hex id per line.
pub fn parse_lock_ids(stdout: &[u8]) -> Result<Vec<String>, CommandFailure> {
    let text = String::from_utf8_lossy(stdout);
    let mut ids = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !line
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(CommandFailure::new(
                FailureKind::ParseError,
                format!("unexpected line in lock list: {:?}", line),
            ));
        }
        ids.push(line.to_string());
    }
    Ok(ids)
}

/// Parse `restic cat lock <id>`.
pub fn parse_lock(stdout: &[u8]) -> Result<LockInfo, CommandFailure> {
    serde_json::from_slice(stdout).map_err(|e| {
        CommandFailure::new(
            FailureKind::ParseError,
            format!("failed to parse lock: {}", e),
        )
    })
}

fn failure_message(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).replace('\n', " ");
    let stderr = stderr.trim();
    let stderr = match stderr.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => &stderr[..idx],
        None => stderr,
    };
    match output.status.code() {
        Some(code) => format!("{} Exit code: {}", stderr, code),
        None => format!("{} Terminated by signal", stderr),
    }
}

fn reports_integrity_errors(output: &std::process::Output) -> bool {
    let needle = "repository contains errors";
    String::from_utf8_lossy(&output.stderr).contains(needle)
        || String::from_utf8_lossy(&output.stdout).contains(needle)
}

/// [`CommandRunner`] that executes the `restic` binary.
#[derive(Debug, Clone)]
pub struct ResticRunner {
    binary: String,
    insecure_tls: bool,
}

impl ResticRunner {
    /// Create a runner for the given restic binary.
    ///
    /// # Examples
    ///
    /// ```
    /// use restic_exporter::restic::ResticRunner;
    ///
    /// let runner = ResticRunner::new("restic", false);
    /// ```
    pub fn new(binary: impl Into<String>, insecure_tls: bool) -> Self {
        Self {
            binary: binary.into(),
            insecure_tls,
        }
    }

    /// Arguments for one restic process.
    fn args(&self, repository: &RepositoryConfig, subcommand: &[&str]) -> Vec<String> {
        let mut args = vec![
            "-r".to_string(),
            repository.location.clone(),
            "--password-file".to_string(),
            repository.password_file.clone(),
            "--no-lock".to_string(),
        ];
        if self.insecure_tls {
            args.push("--insecure-tls".to_string());
        }
        args.extend(subcommand.iter().map(|s| s.to_string()));
        args
    }

    /// Run one restic process, killing it if the deadline passes.
    async fn invoke(
        &self,
        repository: &RepositoryConfig,
        subcommand: &[&str],
        deadline: Instant,
    ) -> Result<std::process::Output, CommandFailure> {
        let args = self.args(repository, subcommand);
        debug!(
            "Running {} {} for {}",
            self.binary,
            subcommand.join(" "),
            repository.id
        );

        let child = ProcessCommand::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CommandFailure::new(
                    FailureKind::Unknown,
                    format!("failed to spawn {}: {}", self.binary, e),
                )
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CommandFailure::new(
                FailureKind::Unknown,
                format!("failed to wait for {}: {}", self.binary, e),
            )),
            Err(_) => {
                warn!(
                    "restic {} for {} timed out",
                    subcommand.join(" "),
                    repository.id
                );
                Err(CommandFailure::new(
                    FailureKind::Timeout,
                    format!("restic {} timed out", subcommand.join(" ")),
                ))
            }
        }
    }

    /// Run a process and turn a non-zero exit into a classified failure.
    async fn invoke_checked(
        &self,
        repository: &RepositoryConfig,
        subcommand: &[&str],
        deadline: Instant,
    ) -> Result<Vec<u8>, CommandFailure> {
        let output = self.invoke(repository, subcommand, deadline).await?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let kind = classify(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        );
        let message = failure_message(&output);
        warn!(
            "restic {} for {} failed ({}): {}",
            subcommand.join(" "),
            repository.id,
            kind,
            message
        );
        Err(CommandFailure::new(kind, message))
    }

    async fn query_lock(
        &self,
        repository: &RepositoryConfig,
        deadline: Instant,
    ) -> Result<LockState, CommandFailure> {
        let stdout = self
            .invoke_checked(repository, &["list", "locks"], deadline)
            .await?;
        let ids = parse_lock_ids(&stdout)?;

        let mut locks = Vec::new();
        for id in ids.iter().take(MAX_LOCK_DETAILS) {
            match self
                .invoke_checked(repository, &["cat", "lock", id], deadline)
                .await
            {
                Ok(stdout) => locks.push(parse_lock(&stdout)?),
                // Released between listing and reading it
                Err(e) if e.kind == FailureKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(LockState::from_locks(ids.len(), &locks))
    }

    async fn check_integrity(
        &self,
        repository: &RepositoryConfig,
        deadline: Instant,
    ) -> Result<IntegrityReport, CommandFailure> {
        let output = self.invoke(repository, &["check"], deadline).await?;
        if output.status.success() {
            return Ok(IntegrityReport {
                errors_found: false,
            });
        }
        if output.status.code() == Some(1) && reports_integrity_errors(&output) {
            warn!("restic check found errors in {}", repository.id);
            return Ok(IntegrityReport { errors_found: true });
        }
        let kind = classify(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        );
        Err(CommandFailure::new(kind, failure_message(&output)))
    }
}

#[async_trait]
impl CommandRunner for ResticRunner {
    async fn run(
        &self,
        repository: &RepositoryConfig,
        command: &Command,
        timeout: Duration,
    ) -> Result<Payload, CommandFailure> {
        let deadline = Instant::now() + timeout;
        match command {
            Command::ListSnapshots => {
                let stdout = self
                    .invoke_checked(repository, &["snapshots", "--json"], deadline)
                    .await?;
                parse_snapshots(&stdout).map(Payload::Snapshots)
            }
            Command::ComputeStats { mode, target } => {
                let mut sub = vec!["stats", "--json", "--mode", mode.as_str()];
                match target {
                    StatsTarget::Repository => {}
                    StatsTarget::Latest => sub.push("latest"),
                    StatsTarget::Snapshot(id) => sub.push(id.as_str()),
                }
                let stdout = self.invoke_checked(repository, &sub, deadline).await?;
                parse_stats(&stdout).map(Payload::Stats)
            }
            Command::QueryLock => self.query_lock(repository, deadline).await.map(Payload::Locks),
            Command::CheckIntegrity => self
                .check_integrity(repository, deadline)
                .await
                .map(Payload::Integrity),
        }
    }
}
