//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline status reporting, and
//! Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (requires scan data or a live stream)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::application::pipeline::DegradeState;
use crate::application::ports::StreamControl;
use crate::domain::market::Snapshot;
use crate::infrastructure::kis::stream::{ConnectionState, StreamHandle};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Sentinel version.
    pub version: String,
    /// Process uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Streaming feed status.
    pub stream: StreamStatus,
    /// Scanner status.
    pub scanner: ScannerStatus,
    /// Whether adaptive degradation has engaged safe mode.
    pub safe_mode: bool,
    /// Subscription slots currently shed under backpressure.
    pub shed: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

/// Streaming connection status.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    /// Connection state.
    pub state: String,
    /// Whether the stream is live.
    pub live: bool,
    /// Reconnect attempts since startup.
    pub reconnects: u64,
    /// Current subscription count.
    pub active_subscriptions: usize,
}

/// REST scanner status.
#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    /// Seconds since the last completed scan, if any.
    pub snapshot_age_secs: Option<i64>,
    /// Symbols covered by the last snapshot.
    pub coverage: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    stream: StreamHandle,
    degrade: Arc<DegradeState>,
    snapshot: watch::Receiver<Snapshot>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        stream: StreamHandle,
        degrade: Arc<DegradeState>,
        snapshot: watch::Receiver<Snapshot>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            stream,
            degrade,
            snapshot,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);

    // Ready once either data path produces: a scan snapshot or a live stream.
    let is_ready = response.scanner.coverage > 0 || response.stream.live;

    if is_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let connection = state.stream.status().state();
    let snapshot = state.snapshot.borrow().clone();
    let now = Utc::now();

    let stream = StreamStatus {
        state: connection.as_str().to_string(),
        live: connection == ConnectionState::Live,
        reconnects: state.stream.status().reconnects(),
        active_subscriptions: state.stream.current().len(),
    };
    let scanner = ScannerStatus {
        snapshot_age_secs: snapshot.age(now).map(|age| age.num_seconds()),
        coverage: snapshot.coverage(),
    };
    let safe_mode = state.degrade.safe_mode();

    HealthResponse {
        status: determine_health_status(&stream, &scanner, safe_mode),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: now,
        stream,
        scanner,
        safe_mode,
        shed: state.degrade.shed(),
    }
}

fn determine_health_status(
    stream: &StreamStatus,
    scanner: &ScannerStatus,
    safe_mode: bool,
) -> HealthStatus {
    let scanning = scanner.coverage > 0;
    if safe_mode || (!stream.live && !scanning) {
        return HealthStatus::Unhealthy;
    }
    if stream.live && scanning {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(live: bool) -> StreamStatus {
        StreamStatus {
            state: if live { "live" } else { "disconnected" }.to_string(),
            live,
            reconnects: 0,
            active_subscriptions: 0,
        }
    }

    fn scanner(coverage: usize) -> ScannerStatus {
        ScannerStatus {
            snapshot_age_secs: if coverage > 0 { Some(12) } else { None },
            coverage,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn both_paths_up_is_healthy() {
        assert_eq!(
            determine_health_status(&stream(true), &scanner(120), false),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn one_path_down_is_degraded() {
        assert_eq!(
            determine_health_status(&stream(false), &scanner(120), false),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(&stream(true), &scanner(0), false),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn safe_mode_or_total_outage_is_unhealthy() {
        assert_eq!(
            determine_health_status(&stream(true), &scanner(120), true),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            determine_health_status(&stream(false), &scanner(0), false),
            HealthStatus::Unhealthy
        );
    }
}
