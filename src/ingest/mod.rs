use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::counter::{self, CounterStore};
use crate::health::PipelineMetrics;

/// HTTP server for activity heartbeats, health, and metrics.
pub struct IngestServer {
    addr: String,
    state: Arc<AppState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

/// Shared state for axum handlers.
struct AppState {
    counters: Arc<CounterStore>,
    metrics: Arc<PipelineMetrics>,
    /// Seconds credited per heartbeat.
    quantum: Duration,
    /// TTL applied to activity counter keys.
    counter_ttl: Duration,
}

impl IngestServer {
    pub fn new(
        addr: &str,
        counters: Arc<CounterStore>,
        metrics: Arc<PipelineMetrics>,
        quantum: Duration,
        counter_ttl: Duration,
    ) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(AppState {
                counters,
                metrics,
                quantum,
                counter_ttl,
            }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":8080"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = Router::new()
            .route("/activity/heartbeat", post(heartbeat_handler))
            .route("/healthz", get(healthz_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone());

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "ingest server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "ingest server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// POST /activity/heartbeat request body.
#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    student_id: String,
    #[serde(default)]
    subject: Option<String>,
}

/// POST /activity/heartbeat - credits one quantum of activity time.
async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    let student_id = req.student_id.trim();
    if student_id.is_empty() {
        state.metrics.heartbeats_rejected.inc();
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "student_id is required"})),
        );
    }

    let subject = match req.subject.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s,
        _ => "General",
    };

    let key = counter::activity_key(student_id, subject, Utc::now().date_naive());
    let total = state
        .counters
        .incr_by(&key, state.quantum.as_secs() as i64, state.counter_ttl);

    state.metrics.heartbeats.inc();
    tracing::debug!(key = %key, total, "heartbeat recorded");

    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}
