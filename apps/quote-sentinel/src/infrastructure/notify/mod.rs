//! Alert Delivery
//!
//! Webhook implementation of the alert sink port. Alerts are posted as
//! JSON; delivery failures are reported to the caller, which logs and
//! moves on rather than retrying.

use std::time::Duration;

use async_trait::async_trait;

use crate::application::ports::{AlertSink, SinkError};
use crate::domain::market::AlertRecord;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts alerts to a configured webhook endpoint.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    /// Create a sink posting to `url`.
    #[must_use]
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn deliver(&self, alert: &AlertRecord) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(DELIVERY_TIMEOUT)
            .json(alert)
            .send()
            .await
            .map_err(|e| SinkError::Delivery(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(symbol = %alert.symbol, kind = alert.kind.as_str(), "alert delivered");
            Ok(())
        } else {
            Err(SinkError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_alert() -> AlertRecord {
        AlertRecord {
            symbol: "005930".to_string(),
            name: "삼성전자".to_string(),
            kind: crate::domain::market::AlertKind::DisparityBelow,
            threshold: -0.08,
            observed: -0.092,
            price: dec!(64200),
            triggered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_alert_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/alerts"))
            .and(body_partial_json(serde_json::json!({
                "symbol": "005930",
                "kind": "disparity_below",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookAlertSink::new(
            reqwest::Client::new(),
            format!("{}/hooks/alerts", server.uri()),
        );
        sink.deliver(&sample_alert()).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = WebhookAlertSink::new(reqwest::Client::new(), server.uri());
        assert!(matches!(
            sink.deliver(&sample_alert()).await,
            Err(SinkError::Rejected { status: 503 })
        ));
    }
}
