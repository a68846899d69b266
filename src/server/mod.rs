//! Observability endpoints
//!
//! The surrounding process surface for the data the core produces:
//! `GET /health` (200 while no service is FAILED, else 503), `GET /metrics`
//! (rolling aggregate), and `POST /health/reset/{service_id}`.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::health::{HealthMonitor, ServiceId};
use crate::metrics::MetricsManager;
use crate::pipeline::coordinator::PipelineCoordinator;

/// Shared state composed at startup and passed to every handler; replaces
/// any global singletons.
#[derive(Clone)]
pub struct ServerContext {
    pub coordinator: Arc<PipelineCoordinator>,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<MetricsManager>,
}

pub fn router(context: ServerContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/reset/{service_id}", post(health_reset_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

/// Serve the observability surface until the listener fails.
pub async fn start(host: &str, port: u16, context: ServerContext) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Observability endpoints listening on http://{}", addr);
    axum::serve(listener, router(context))
        .await
        .context("Observability server failed")?;
    Ok(())
}

async fn health_handler(State(context): State<ServerContext>) -> impl IntoResponse {
    let services = context.health.snapshot().await;
    let healthy = context.health.overall_healthy().await;
    let body = json!({
        "status": if healthy { "ok" } else { "failed" },
        "active_sessions": context.coordinator.session_count().await,
        "services": services,
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn health_reset_handler(
    State(context): State<ServerContext>,
    Path(service_id): Path<String>,
) -> impl IntoResponse {
    let Ok(service_id) = service_id.parse::<ServiceId>() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown service: {}", service_id) })),
        );
    };

    if context.health.reset(service_id).await {
        (
            StatusCode::OK,
            Json(json!({ "reset": service_id.as_str() })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("service not monitored: {}", service_id.as_str()) })),
        )
    }
}

async fn metrics_handler(State(context): State<ServerContext>) -> impl IntoResponse {
    Json(context.metrics.aggregate())
}
