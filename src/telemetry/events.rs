//! Telemetry events emitted by the watchdog

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::TelemetryConfig;
use crate::obfuscation;

/// Event kinds understood by the telemetry endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// The executable digest did not match the supplied one
    HashMismatch,
}

impl EventType {
    /// Name used in the `event=` query parameter
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::HashMismatch => "HashMismatch",
        }
    }
}

/// A single telemetry event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Event kind
    pub event_type: EventType,
    /// When the event happened, seconds since the UNIX epoch
    pub event_time: u64,
    /// Digest computed for the executable (empty when it could not be read)
    pub computed_hash: String,
    /// The executable that was checked
    pub executable: PathBuf,
}

impl TelemetryEvent {
    /// Build a hash mismatch event
    pub fn hash_mismatch(event_time: u64, computed_hash: impl Into<String>, executable: PathBuf) -> Self {
        Self {
            event_type: EventType::HashMismatch,
            event_time,
            computed_hash: computed_hash.into(),
            executable,
        }
    }

    /// Request path including the query string
    pub fn path(&self, config: &TelemetryConfig) -> String {
        let (major, minor) = config.api_version;
        format!(
            "/{}.{}/watchdog/event?eventTime={}&event={}",
            major,
            minor,
            self.event_time,
            self.event_type.as_str()
        )
    }

    /// Full request URL
    pub fn url(&self, config: &TelemetryConfig) -> String {
        format!("{}{}", config.base_url(), self.path(config))
    }

    /// Clear-text request body
    pub fn body(&self) -> String {
        format!("hash={}&exe={}", self.computed_hash, self.executable.display())
    }

    /// Body as sent on the wire, obfuscated when the configuration asks for it
    pub fn wire_body(&self, config: &TelemetryConfig) -> String {
        let body = self.body();
        if config.encrypt_payload {
            obfuscation::encrypt_and_encode(&config.payload_key, body.as_bytes())
        } else {
            body
        }
    }
}
