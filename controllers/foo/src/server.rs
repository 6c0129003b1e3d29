//! Probe and metrics endpoints.
//!
//! - `/healthz`: the process is up
//! - `/readyz`: every cache finished its initial list
//! - `/metrics`: Prometheus text format

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use reconcile_runtime::RuntimeMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state of the handlers.
#[derive(Clone)]
pub struct ServerState {
    metrics: RuntimeMetrics,
    ready: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState").finish_non_exhaustive()
    }
}

impl ServerState {
    /// `ready` is polled on every `/readyz` request.
    pub fn new(metrics: RuntimeMetrics, ready: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            metrics,
            ready: Arc::new(ready),
        }
    }
}

/// Routes of the health and metrics server.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving probes and metrics on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Probe server stopped");
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ServerState>) -> impl IntoResponse {
    if (state.ready)() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn metrics() -> RuntimeMetrics {
        RuntimeMetrics::new(&Registry::new()).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_is_always_ok() {
        let app = router(ServerState::new(metrics(), || false));
        assert_eq!(get_path(app, "/healthz").await, (StatusCode::OK, "ok".to_string()));
    }

    #[tokio::test]
    async fn test_readyz_follows_cache_sync() {
        let synced = Arc::new(AtomicBool::new(false));
        let state = {
            let synced = Arc::clone(&synced);
            ServerState::new(metrics(), move || synced.load(Ordering::SeqCst))
        };
        let app = router(state);

        let (status, _) = get_path(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        synced.store(true, Ordering::SeqCst);
        let (status, _) = get_path(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposes_reconcile_counters() {
        let metrics = metrics();
        metrics.observe_reconcile("Foo", true, Duration::from_millis(2));
        let app = router(ServerState::new(metrics, || true));

        let (status, body) = get_path(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("reconcile_total{kind=\"Foo\",result=\"success\"} 1"));
    }
}
