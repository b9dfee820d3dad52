//! HTTP server for the metrics, stats and liveness endpoints.

use crate::metrics::MetricsRegistry;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use registry::{HealthMonitor, RegistryService};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state of the HTTP handlers
pub struct AppState {
    pub metrics: Arc<MetricsRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub registry: Arc<RegistryService>,
}

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    state: Arc<AppState>,
    listen_addr: String,
}

impl MetricsServer {
    pub fn new(state: Arc<AppState>, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .route("/healthz", get(healthz_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(listen_addr = %self.listen_addr, "Starting metrics HTTP server");

        let app = Self::router(self.state);
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(
            listen_addr = %listener.local_addr()?,
            "Metrics server listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("Metrics server stopped");
        Ok(())
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Handler for /stats endpoint: monitor and subscription counters as JSON
async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.monitor.get_stats();
    let last_sweep = state.monitor.last_sweep().map(|sweep| {
        json!({
            "tenants": sweep.tenants,
            "failed_tenants": sweep.failed_tenants,
            "services": sweep.services,
            "instances": sweep.instances,
            "evicted": sweep.evicted,
            "duration_ms": sweep.duration.as_millis() as u64,
        })
    });

    Json(json!({
        "monitor": stats,
        "success_rate": stats.success_rate(),
        "last_sweep": last_sweep,
        "running": state.registry.is_running().await,
        "subscribers": state.registry.subscriber_count().await,
        "dropped_events": state.registry.dropped_event_count(),
    }))
    .into_response()
}

async fn healthz_handler() -> &'static str {
    "ok"
}
