//! Health, readiness and Prometheus endpoints, plus the shared serve helper

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metricsserver_lib::{health::HealthRegistry, observability::MetricsServerMetrics};
use prometheus::{Encoder, TextEncoder};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

/// State behind the health router
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: MetricsServerMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: MetricsServerMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

fn probe_status(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// 200 while every component is healthy or degraded
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let health = state.health_registry.health().await;
    (probe_status(health.status.is_operational()), Json(health)).into_response()
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health_registry.readiness().await;
    (probe_status(readiness.ready), Json(readiness)).into_response()
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => (
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode Prometheus metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Router for `/healthz`, `/readyz` and `/metrics`
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind `0.0.0.0:port` and serve `router` until `shutdown` resolves
pub async fn serve<F>(
    name: &'static str,
    port: u16,
    router: Router,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind {} server on port {}", name, port))?;
    info!(server = name, addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!(server = name, "Server stopped");
    Ok(())
}

/// Await `server`, marking `component` unhealthy if it fails
pub async fn report_failure<F>(
    health: HealthRegistry,
    component: &'static str,
    server: F,
) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let result = server.await;
    if let Err(e) = &result {
        health.set_unhealthy(component, format!("{:#}", e)).await;
    }
    result
}
