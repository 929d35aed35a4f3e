// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Status and metrics HTTP endpoint

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use clen::{CollectionProgress, CollectorStats, NodeId, RetrieverStats};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::Metrics;

/// State shared across handlers
pub struct StatusState {
    pub started: Instant,
    pub transport: &'static str,
    pub nodes: Vec<NodeId>,
    pub progress: CollectionProgress,
    pub collector: Arc<CollectorStats>,
    pub retriever: Arc<RetrieverStats>,
    pub metrics: Metrics,
}

/// `/status` body
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: u64,
    pub transport: String,
    pub nodes: Vec<String>,
    pub collected_timestamp: u64,
    pub delivered_timestamp: u64,
    pub cycles: u64,
    pub deliveries: u64,
}

pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve until cancelled
pub async fn serve(
    bind: SocketAddr,
    state: Arc<StatusState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %bind, "Status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub async fn status_handler(State(state): State<Arc<StatusState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: clen::VERSION.to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        transport: state.transport.to_string(),
        nodes: state.nodes.iter().map(ToString::to_string).collect(),
        collected_timestamp: state.progress.get(),
        delivered_timestamp: state.retriever.last_sent(),
        cycles: state.collector.cycles(),
        deliveries: state.retriever.delivered(),
    })
}

pub async fn metrics_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    state
        .metrics
        .update(&state.collector, &state.retriever, state.progress.get());
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("Content-Type", "text/plain; charset=utf-8")],
                e.to_string(),
            )
        }
    }
}
