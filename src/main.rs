use anyhow::Result;
use clap::Parser;
use restic_exporter::{
    config::{LogFormat, ScheduleMode, Settings},
    metrics::MetricsRegistry,
    restic::ResticRunner,
    scheduler::Scheduler,
    server::start_server,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Restic Exporter - Prometheus metrics exporter for restic backup repositories
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "RESTIC_EXPORTER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let settings = Settings::load(args.config.as_deref())?;

    // Initialize logging
    init_logging(&settings.exporter.log_level, settings.exporter.log_format)?;

    info!("Starting restic exporter");
    info!(
        "Repositories: {}",
        settings
            .repositories
            .iter()
            .map(|r| r.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("Listen address: {}", settings.exporter.listen_address);

    let registry = Arc::new(MetricsRegistry::new(
        settings.repositories.iter().map(|r| r.id.clone()),
    )?);
    let runner = Arc::new(ResticRunner::new(
        settings.restic.binary.clone(),
        settings.restic.insecure_tls,
    ));
    let scheduler = Arc::new(Scheduler::new(
        &settings.repositories,
        &settings.restic,
        runner,
        Arc::clone(&registry),
    ));
    info!("Scheduler initialized ({:?} mode)", settings.restic.schedule);

    if settings.restic.schedule == ScheduleMode::Interval {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await });
    }

    // Start HTTP server
    info!("Starting HTTP server...");
    if let Err(e) = start_server(&settings.exporter.listen_address, registry, scheduler).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Initialize structured logging with tracing.
fn init_logging(log_level: &str, format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    Ok(())
}
