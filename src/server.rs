//! HTTP server for exposing Prometheus metrics.
//!
//! This module provides an Axum-based HTTP server that serves the `/metrics`
//! endpoint for Prometheus scraping and a `/health` endpoint for health checks.
//! Scrapes only read the published sample sets; collection happens in the
//! background on the [`Scheduler`].

use crate::config::ScheduleMode;
use crate::error::{ExporterError, Result};
use crate::metrics::MetricsRegistry;
use crate::scheduler::Scheduler;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared application state.
#[derive(Clone)]
struct AppState {
    registry: Arc<MetricsRegistry>,
    scheduler: Arc<Scheduler>,
}

/// Build the exporter's router.
pub fn router(registry: Arc<MetricsRegistry>, scheduler: Arc<Scheduler>) -> Router {
    let state = AppState {
        registry,
        scheduler,
    };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// # Arguments
///
/// * `listen_address` - Address to bind to (e.g., "0.0.0.0:8001")
/// * `registry` - Registry holding the published sample sets
/// * `scheduler` - Scheduler nudged by scrapes in lazy mode
///
/// # Examples
///
/// ```no_run
/// use restic_exporter::config::{RepositoryConfig, ResticConfig};
/// use restic_exporter::metrics::MetricsRegistry;
/// use restic_exporter::restic::ResticRunner;
/// use restic_exporter::scheduler::Scheduler;
/// use restic_exporter::server::start_server;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let repositories = vec![RepositoryConfig::new("alpine", "/srv/restic/alpine", "/etc/restic/alpine.pw")];
///     let restic = ResticConfig::default();
///     let registry = Arc::new(MetricsRegistry::new(["alpine"]).unwrap());
///     let runner = Arc::new(ResticRunner::new("restic", false));
///     let scheduler = Arc::new(Scheduler::new(&repositories, &restic, runner, registry.clone()));
///     start_server("0.0.0.0:8001", registry, scheduler).await.unwrap();
/// }
/// ```
pub async fn start_server(
    listen_address: &str,
    registry: Arc<MetricsRegistry>,
    scheduler: Arc<Scheduler>,
) -> Result<()> {
    let app = router(registry, scheduler);

    info!("Starting HTTP server on {}", listen_address);

    let listener = TcpListener::bind(listen_address).await?;

    axum::serve(listener, app)
        .await
        .map_err(|e| ExporterError::Server(e.to_string()))?;

    Ok(())
}

/// Handler for /metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    debug!("Received metrics scrape request");

    // Runs are spawned, never awaited here
    if state.scheduler.mode() == ScheduleMode::Lazy {
        state.scheduler.nudge();
    }

    match state.registry.encode() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Handler for /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

/// Handler for root endpoint.
async fn root_handler() -> Response {
    let html = r#"
<!DOCTYPE html>
<html>
<head>
    <title>Restic Exporter</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; }
        h1 { color: #333; }
        a { color: #0066cc; text-decoration: none; }
        a:hover { text-decoration: underline; }
        .info { background: #f0f0f0; padding: 15px; border-radius: 5px; margin: 20px 0; }
    </style>
</head>
<body>
    <h1>Restic Exporter</h1>
    <div class="info">
        <p>Prometheus metrics exporter for restic backup repositories</p>
        <p><strong>Endpoints:</strong></p>
        <ul>
            <li><a href="/metrics">/metrics</a> - Prometheus metrics</li>
            <li><a href="/health">/health</a> - Health check</li>
        </ul>
    </div>
</body>
</html>
"#;

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}
