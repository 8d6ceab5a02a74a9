//! HTTP delivery of telemetry events

use async_trait::async_trait;

use super::{TelemetryConfig, TelemetryError, TelemetryEvent, TelemetryResult, TelemetrySink};

/// Posts events to the configured telemetry host
pub struct HttpTelemetry {
    config: TelemetryConfig,
    client: reqwest::Client,
}

impl HttpTelemetry {
    /// Create a client with the configured user agent and timeout
    pub fn new(config: TelemetryConfig) -> TelemetryResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .map_err(|e| TelemetryError::ClientError(e.to_string()))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetry {
    async fn send(&self, event: &TelemetryEvent) -> TelemetryResult<()> {
        if !self.config.enabled {
            return Err(TelemetryError::Disabled);
        }

        let url = event.url(&self.config);
        let body = event.wire_body(&self.config);
        tracing::debug!(
            "Sending {} telemetry to {} (encrypted: {})",
            event.event_type.as_str(),
            url,
            self.config.encrypt_payload
        );

        let response = self
            .client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await
            .map_err(|e| TelemetryError::SendError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("Telemetry server returned status: {}", status);
            return Err(TelemetryError::Status(status.as_u16()));
        }

        tracing::info!("Reported {} event", event.event_type.as_str());
        Ok(())
    }
}
