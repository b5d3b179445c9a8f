//! Debug HTTP endpoint: health and metrics.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::metrics::MetricsRegistry;

#[derive(Clone)]
struct DebugState {
    registry: Arc<MetricsRegistry>,
    started: Instant,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    uptime_secs: u64,
}

async fn healthz(State(state): State<DebugState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn metrics(State(state): State<DebugState>) -> String {
    state.registry.encode()
}

/// Serve `GET /healthz` and `GET /metrics` on `addr` until the process
/// exits.
pub async fn serve(addr: &str, registry: Arc<MetricsRegistry>) -> Result<()> {
    let state = DebugState {
        registry,
        started: Instant::now(),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind debug listener on {addr}"))?;
    info!(address = %listener.local_addr()?, "debug endpoint listening");

    axum::serve(listener, app)
        .await
        .context("debug endpoint error")
}
