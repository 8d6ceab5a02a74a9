//! Telemetry for the watchdog
//!
//! A single event is reported today: the target executable failed its
//! integrity check. The event is POSTed to a fixed host over HTTPS, either in
//! clear or passed through the obfuscation channel when the configuration
//! enables it.

mod client;
mod config;
mod events;

#[cfg(test)]
mod tests;

pub use client::HttpTelemetry;
pub use config::TelemetryConfig;
pub use events::{EventType, TelemetryEvent};

use async_trait::async_trait;
use thiserror::Error;

/// Telemetry errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Telemetry is disabled")]
    Disabled,

    #[error("Failed to build HTTP client: {0}")]
    ClientError(String),

    #[error("Failed to send telemetry: {0}")]
    SendError(String),

    #[error("Server returned status: {0}")]
    Status(u16),
}

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Destination for telemetry events
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver one event. Implementations do not retry.
    async fn send(&self, event: &TelemetryEvent) -> TelemetryResult<()>;
}

/// Sink that drops every event, used when telemetry is switched off
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

#[async_trait]
impl TelemetrySink for NullTelemetry {
    async fn send(&self, event: &TelemetryEvent) -> TelemetryResult<()> {
        tracing::debug!("Telemetry disabled, dropping {:?} event", event.event_type);
        Ok(())
    }
}

/// Build the sink described by the configuration
pub fn sink_from_config(config: &TelemetryConfig) -> TelemetryResult<Box<dyn TelemetrySink>> {
    if !config.enabled {
        return Ok(Box::new(NullTelemetry));
    }
    Ok(Box::new(HttpTelemetry::new(config.clone())?))
}
