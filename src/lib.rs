//! # Restic Exporter
//!
//! A Prometheus metrics exporter for restic backup repositories.
//!
//! ## Overview
//!
//! Collection runs execute restic's read-only inspection commands in the
//! background and publish per-repository sample sets. Scrapes render the
//! latest published sets and never wait on restic. Exported data includes:
//!
//! - Backup staleness and summary per host/tag group
//! - Repository size and compression statistics
//! - Lock state, including repositories left locked across runs
//! - Integrity check results
//! - Per-check success and classified failures
//!
//! ## Quick Start
//!
//! ```no_run
//! use restic_exporter::{
//!     config::Settings, metrics::MetricsRegistry, restic::ResticRunner,
//!     scheduler::Scheduler, server::start_server,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load configuration
//!     let settings = Settings::load(Some("config/default.toml"))?;
//!
//!     let registry = Arc::new(MetricsRegistry::new(
//!         settings.repositories.iter().map(|r| r.id.clone()),
//!     )?);
//!     let runner = Arc::new(ResticRunner::new(&settings.restic.binary, settings.restic.insecure_tls));
//!     let scheduler = Arc::new(Scheduler::new(
//!         &settings.repositories,
//!         &settings.restic,
//!         runner,
//!         registry.clone(),
//!     ));
//!
//!     // Collect in the background, serve in the foreground
//!     let background = scheduler.clone();
//!     tokio::spawn(async move { background.run().await });
//!     start_server(&settings.exporter.listen_address, registry, scheduler).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The exporter can be configured via:
//! - TOML configuration file
//! - Environment variables (with `RESTIC_EXPORTER_` prefix)
//! - `RESTIC_REPOSITORY` and `RESTIC_PASSWORD_FILE` for a single repository
//!
//! See [`config::Settings`] for details.
//!
//! ## Modules
//!
//! - [`collector`] - Per-repository collection runs
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling
//! - [`metrics`] - Metric catalog and the published sample registry
//! - [`restic`] - restic invocation and output parsing
//! - [`scheduler`] - When each repository is collected
//! - [`server`] - HTTP server for exposing metrics

pub mod collector;
pub mod config;
pub mod error;
pub mod metrics;
pub mod restic;
pub mod scheduler;
pub mod server;

pub use error::{ExporterError, Result};
