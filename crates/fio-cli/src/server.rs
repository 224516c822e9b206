//! HTTP server for health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use fio_core::health::{ComponentStatus, HealthCheck, HealthStatus};
use fio_core::metrics::PipelineMetrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub health: Arc<HealthCheck>,
    pub metrics: Arc<PipelineMetrics>,
}

/// Health response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub running: bool,
    pub uptime_seconds: u64,
    pub components: BTreeMap<&'static str, ComponentStatusResponse>,
}

/// Component status response.
#[derive(Debug, Serialize)]
pub struct ComponentStatusResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ComponentStatus> for ComponentStatusResponse {
    fn from(status: &ComponentStatus) -> Self {
        let (status, message) = match status {
            ComponentStatus::Healthy => ("healthy", None),
            ComponentStatus::Degraded(msg) => ("degraded", Some(msg.clone())),
            ComponentStatus::Unhealthy(msg) => ("unhealthy", Some(msg.clone())),
            ComponentStatus::Unknown => ("unknown", None),
        };
        ComponentStatusResponse { status, message }
    }
}

fn health_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

fn metrics_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve health and metrics until the shutdown signal fires.
pub async fn start_server(
    state: Arc<ServerState>,
    health_port: u16,
    metrics_port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let health_addr = SocketAddr::from(([0, 0, 0, 0], health_port));
    let health_listener = match tokio::net::TcpListener::bind(health_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = health_port, "Failed to bind health server");
            return;
        }
    };
    info!(port = health_port, "Health server started");

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let metrics_listener = match tokio::net::TcpListener::bind(metrics_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = metrics_port, "Failed to bind metrics server");
            return;
        }
    };
    info!(port = metrics_port, "Metrics server started");

    let health_server = async {
        axum::serve(health_listener, health_router(Arc::clone(&state)))
            .await
            .map_err(|e| error!(error = %e, "Health server error"))
    };

    let metrics_server = async {
        axum::serve(metrics_listener, metrics_router(Arc::clone(&state)))
            .await
            .map_err(|e| error!(error = %e, "Metrics server error"))
    };

    tokio::select! {
        _ = health_server => {}
        _ = metrics_server => {}
        _ = shutdown_rx.recv() => {
            info!("HTTP servers shutting down");
        }
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let overall = state.health.overall_status();

    let components = state
        .health
        .all_statuses()
        .iter()
        .map(|(component, status)| (component.as_str(), ComponentStatusResponse::from(status)))
        .collect();

    let response = HealthResponse {
        status: overall.as_str(),
        running: state.health.is_running(),
        uptime_seconds: state.health.uptime_seconds(),
        components,
    };

    let status_code = match overall {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

/// Liveness: the pipeline loop is running.
async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.health.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Readiness: running, consuming, and no component unhealthy.
async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.metrics.export_prometheus_text() {
        Ok(text) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            text,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                e.to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fio_core::health::Component;

    fn state() -> Arc<ServerState> {
        Arc::new(ServerState {
            health: Arc::new(HealthCheck::new()),
            metrics: Arc::new(PipelineMetrics::new().unwrap()),
        })
    }

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_component_status_conversion() {
        let response = ComponentStatusResponse::from(&ComponentStatus::Healthy);
        assert_eq!(response.status, "healthy");
        assert!(response.message.is_none());

        let response = ComponentStatusResponse::from(&ComponentStatus::Degraded("slow".into()));
        assert_eq!(response.status, "degraded");
        assert_eq!(response.message.as_deref(), Some("slow"));

        let response = ComponentStatusResponse::from(&ComponentStatus::Unknown);
        assert_eq!(response.status, "unknown");
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let state = state();
        let base = spawn(health_router(Arc::clone(&state))).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/readyz", base)).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        state.health.pipeline_started();
        state.health.mark_healthy(Component::Consumer);
        let resp = client.get(format!("{}/readyz", base)).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        state
            .health
            .mark_unhealthy(Component::Publisher, "dead-letter delivery failed");
        let resp = client.get(format!("{}/health", base)).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["components"]["publisher"]["status"], "unhealthy");
        assert_eq!(body["components"]["consumer"]["status"], "healthy");
        assert_eq!(body["running"], true);

        // still alive while running
        let resp = client.get(format!("{}/healthz", base)).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = state();
        state.metrics.record_consumed();
        let base = spawn(metrics_router(Arc::clone(&state))).await;

        let resp = reqwest::get(format!("{}/metrics", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let text = resp.text().await.unwrap();
        assert!(text.contains("fio_messages_consumed_total 1"));
    }
}
