//! HTTP surface of the daemon
//!
//! `/metrics` renders the sweeper registry in OpenMetrics text, `/healthz`
//! answers while the process is up, and `/readyz` answers 200 only while the
//! shard store can be listed.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use opendal::Operator;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use shardrop_transfer::SweepReport;
use std::sync::Arc;
use tracing::{error, info};

/// Expiry sweeper counters
#[derive(Clone, Default)]
pub struct SweepMetrics {
    pub sweeps: Counter,
    pub expired: Counter,
    pub shards_deleted: Counter,
    /// Records left behind by a sweep, plus sweeps that failed outright
    pub failures: Counter,
    /// Manifests currently stored, live or awaiting the next sweep
    pub manifests: Gauge,
}

impl SweepMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let m = Self::default();
        registry.register("shardrop_sweeps", "Expiry sweeps completed", m.sweeps.clone());
        registry.register(
            "shardrop_manifests_expired",
            "Expired uploads removed with all of their shards",
            m.expired.clone(),
        );
        registry.register(
            "shardrop_shards_deleted",
            "Shard objects deleted by expiry sweeps",
            m.shards_deleted.clone(),
        );
        registry.register(
            "shardrop_sweep_failures",
            "Expired uploads a sweep could not remove, and failed sweeps",
            m.failures.clone(),
        );
        registry.register(
            "shardrop_manifests",
            "Manifests in the store",
            m.manifests.clone(),
        );
        m
    }

    pub fn record(&self, report: &SweepReport) {
        self.sweeps.inc();
        self.expired.inc_by(report.removed as u64);
        self.shards_deleted.inc_by(report.shards_deleted as u64);
        self.failures.inc_by(report.failed as u64);
    }
}

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub operator: Operator,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding metrics listener on {addr}"))?;
    info!(addr = %addr, "http: serving /metrics /healthz /readyz");
    axum::serve(listener, router(state))
        .await
        .context("metrics listener stopped")
}

async fn metrics_handler(State(state): State<HealthState>) -> Response {
    let mut body = String::new();
    if let Err(e) = encode(&mut body, &state.registry) {
        error!(error = %e, "encoding metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// 200 when the shard store answers a listing, 503 otherwise.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if shardrop_storage::is_healthy(&state.operator).await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "storage unreachable")
    }
}
