//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Scan**: scan cycle outcomes
//! - **Transport**: REST retries and cooldowns
//! - **Stream**: reconnects and dropped ticks
//! - **Alerts**: emitted alerts by condition kind
//! - **State**: active subscriptions and safe mode
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::market::AlertKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "sentinel_scan_cycles_total",
        "Scan cycles completed, by result"
    );
    describe_counter!(
        "sentinel_transport_retries_total",
        "REST request retries, by failure class"
    );
    describe_counter!(
        "sentinel_transport_cooldowns_total",
        "Transport-level cooldown pauses after consecutive failures"
    );
    describe_counter!(
        "sentinel_stream_reconnects_total",
        "WebSocket reconnection attempts"
    );
    describe_counter!(
        "sentinel_ticks_dropped_total",
        "Ticks dropped because consumers fell behind"
    );
    describe_counter!(
        "sentinel_alerts_emitted_total",
        "Alerts emitted, by condition kind"
    );

    describe_gauge!(
        "sentinel_active_subscriptions",
        "Symbols currently subscribed on the live feed"
    );
    describe_gauge!(
        "sentinel_safe_mode",
        "Whether the pipeline is in safe mode (1) or not (0)"
    );
}

// =============================================================================
// Recording Helpers
// =============================================================================

/// Record one completed scan cycle with its result label.
pub fn record_scan_cycle(result: &'static str) {
    counter!("sentinel_scan_cycles_total", "result" => result).increment(1);
}

/// Record a REST retry with its failure class.
pub fn record_transport_retry(class: &'static str) {
    counter!("sentinel_transport_retries_total", "class" => class).increment(1);
}

/// Record a transport cooldown pause.
pub fn record_transport_cooldown() {
    counter!("sentinel_transport_cooldowns_total").increment(1);
}

/// Record a WebSocket reconnection attempt.
pub fn record_stream_reconnect() {
    counter!("sentinel_stream_reconnects_total").increment(1);
}

/// Record ticks dropped by a lagging consumer.
pub fn record_ticks_dropped(count: u64) {
    counter!("sentinel_ticks_dropped_total").increment(count);
}

/// Record an emitted alert.
pub fn record_alert_emitted(kind: AlertKind) {
    counter!("sentinel_alerts_emitted_total", "kind" => kind.as_str()).increment(1);
}

/// Update the live subscription count.
pub fn set_active_subscriptions(count: f64) {
    gauge!("sentinel_active_subscriptions").set(count);
}

/// Update the safe-mode gauge.
pub fn set_safe_mode(on: bool) {
    gauge!("sentinel_safe_mode").set(if on { 1.0 } else { 0.0 });
}
