//! # Duewatch Gateway
//! Health/status HTTP surface (axum). Read-only: it reports scheduler and
//! database health, never mutates anything.

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use duewatch_core::config::GatewayConfig;
use duewatch_core::error::{DuewatchError, Result};
use duewatch_scheduler::SchedulerEngine;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SchedulerEngine>,
    pub start_time: std::time::Instant,
}

/// Liveness + readiness in one shot, shaped for probes.
async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let db_ok = state.engine.probe();
    let status = state.engine.status();
    Json(serde_json::json!({
        "status": if db_ok { "healthy" } else { "unhealthy" },
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "services": {
            "database": { "status": if db_ok { "healthy" } else { "unhealthy" } },
            "scheduler": {
                "status": "healthy",
                "last_upcoming_scan": status.last_upcoming_scan,
                "last_reconciliation": status.last_reconciliation,
            },
        },
    }))
}

/// Scheduler snapshot: scan cursors plus pending/failed ledger totals.
async fn scheduler_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.engine.status();
    Json(serde_json::json!(status))
}

/// Build the router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/status", get(scheduler_status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve until the shutdown signal flips.
pub async fn serve(
    config: &GatewayConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| DuewatchError::Gateway(format!("bind {addr}: {e}")))?;
    tracing::info!("🌐 gateway listening on http://{addr}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.changed().await.ok();
        })
        .await
        .map_err(|e| DuewatchError::Gateway(e.to_string()))
}
