//! Metrics and health endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::metrics::SharedMetrics;
use crate::state::ClusterState;

#[derive(Clone)]
struct AppState {
    metrics: SharedMetrics,
    cluster: Arc<ClusterState>,
}

async fn metrics_handler(State(app): State<AppState>) -> String {
    app.metrics.render()
}

async fn healthz(State(app): State<AppState>) -> (StatusCode, &'static str) {
    if app.cluster.synced() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "cluster state not synced")
    }
}

pub async fn serve(
    addr: String,
    metrics: SharedMetrics,
    cluster: Arc<ClusterState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .with_state(AppState { metrics, cluster });

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%addr, %error, "failed to bind metrics listener");
            return;
        }
    };
    info!(%addr, "serving /metrics and /healthz");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(error) = result {
        warn!(%error, "metrics server exited");
    }
}
