//! Telemetry configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether events are sent at all (master switch)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Use HTTPS (port 443) instead of plain HTTP (port 80)
    #[serde(default = "default_true")]
    pub secure: bool,

    /// Telemetry host name
    #[serde(default = "default_host")]
    pub host: String,

    /// API version placed in the request path as `/<major>.<minor>/`
    #[serde(default = "default_api_version")]
    pub api_version: (u32, u32),

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Pass the body through the obfuscation channel before sending
    #[serde(default)]
    pub encrypt_payload: bool,

    /// Key used when `encrypt_payload` is set
    #[serde(default = "default_payload_key")]
    pub payload_key: String,

    /// Request timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "api.orerve.net".to_string()
}

fn default_api_version() -> (u32, u32) {
    (1, 3)
}

fn default_user_agent() -> String {
    "Forc-Watchdog/1.0".to_string()
}

fn default_payload_key() -> String {
    "HX863wRDd9C4265pQM6YZbvk355J8rJC".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            secure: true,
            host: default_host(),
            api_version: default_api_version(),
            user_agent: default_user_agent(),
            encrypt_payload: false,
            payload_key: default_payload_key(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl TelemetryConfig {
    /// Create a new telemetry configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable sending
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the host and scheme
    pub fn with_host(mut self, host: impl Into<String>, secure: bool) -> Self {
        self.host = host.into();
        self.secure = secure;
        self
    }

    /// Turn payload obfuscation on or off
    pub fn with_encrypted_payload(mut self, encrypt: bool) -> Self {
        self.encrypt_payload = encrypt;
        self
    }

    /// Scheme and host, e.g. `https://api.example.net`
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.host)
    }

    /// Get the request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
