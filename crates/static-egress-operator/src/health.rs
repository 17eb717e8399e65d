//! Health check and metrics HTTP server.
//!
//! Provides `/healthz` (liveness), `/readyz` (readiness) and `/metrics`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::ControllerMetrics;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Shared state for the HTTP endpoints.
pub struct HealthState {
    /// Whether the initial listing of egress configuration completed.
    synced: AtomicBool,
    metrics: Arc<ControllerMetrics>,
}

impl HealthState {
    pub fn new(metrics: Arc<ControllerMetrics>) -> Self {
        Self {
            synced: AtomicBool::new(false),
            metrics,
        }
    }

    /// Mark the desired-state cache as populated.
    pub fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::SeqCst) {
            info!("Health check: controller marked as ready");
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves the endpoints on `addr` until `cancel` fires.
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "Health and metrics server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

/// Liveness probe endpoint, 200 while the process runs.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 503 until the controller has listed the egress configuration once.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_synced() {
        debug!("Readiness probe: NOT READY (initial sync incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    debug!("Readiness probe: OK");
    StatusCode::OK
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<HealthState> {
        Arc::new(HealthState::new(Arc::new(ControllerMetrics::new())))
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let result = healthz().await;
        assert_eq!(result, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_before_sync() {
        let result = readyz(State(state())).await;
        assert_eq!(result, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_returns_ok_after_sync() {
        let state = state();
        state.mark_synced();

        let result = readyz(State(state)).await;
        assert_eq!(result, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_mark_synced_is_idempotent() {
        let state = state();
        assert!(!state.is_synced());

        state.mark_synced();
        state.mark_synced();
        assert!(state.is_synced());
    }

    #[tokio::test]
    async fn test_metrics_renders_prometheus_text() {
        let state = state();
        state.metrics.record_failure();

        let response = metrics(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PROMETHEUS_CONTENT_TYPE
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(crate::metrics::ENSURE_FAILURES));
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let server = tokio::spawn(run_health_server(state(), addr, cancel.clone()));

        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
