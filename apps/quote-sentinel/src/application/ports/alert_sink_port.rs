//! Alert Sink Port (Driven Port)
//!
//! Outbound delivery channel for emitted alerts. Delivery failures are
//! reported, logged by the caller, and never block the tick path.

use async_trait::async_trait;

use crate::domain::market::AlertRecord;

/// Alert delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The delivery request could not be completed.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The remote endpoint rejected the alert payload.
    #[error("alert rejected with status {status}")]
    Rejected {
        /// HTTP status returned by the endpoint.
        status: u16,
    },
}

/// Port for alert delivery.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert.
    async fn deliver(&self, alert: &AlertRecord) -> Result<(), SinkError>;
}

/// Sink that emits alerts as structured log events. Used when no webhook is
/// configured, and as the default in tests.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl TracingAlertSink {
    /// Create a new logging sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn deliver(&self, alert: &AlertRecord) -> Result<(), SinkError> {
        tracing::info!(
            symbol = %alert.symbol,
            name = %alert.name,
            kind = alert.kind.as_str(),
            threshold = alert.threshold,
            observed = alert.observed,
            price = %alert.price,
            triggered_at = %alert.triggered_at,
            "alert emitted"
        );
        Ok(())
    }
}
