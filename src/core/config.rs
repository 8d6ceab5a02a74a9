//! Watchdog configuration
//!
//! Settings are read from an optional JSON file and then overridden by the
//! command line. Every field has a default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::logging::LoggingConfig;
use crate::telemetry::TelemetryConfig;
use crate::watchdog::backend::DEFAULT_OBJECT_PREFIX;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// How supervision outcomes are mapped onto the supervisor's exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExitCodePolicy {
    /// Every completed supervision cycle exits with 0
    #[default]
    Compatible,
    /// Each outcome class has its own exit code
    Distinct,
}

/// Main watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Namespace prefix for named kernel objects (segments, events, timers)
    #[serde(default = "default_object_prefix")]
    pub object_prefix: String,

    /// Abort the launch when the executable digest does not match
    #[serde(default = "default_true")]
    pub enforce_integrity: bool,

    /// Run the debugger session instead of the crash-relay channel
    #[serde(default)]
    pub attach_debugger: bool,

    /// How long the supervisor waits for the debugger to confirm attachment
    #[serde(default = "default_attach_timeout_ms")]
    pub debugger_attach_timeout_ms: u64,

    /// Bounded wait used by the debug-event polling loop
    #[serde(default = "default_debug_poll_interval_ms")]
    pub debug_poll_interval_ms: u64,

    /// Explicit path of the external crash report tool
    #[serde(default)]
    pub report_tool: Option<PathBuf>,

    /// File name prefix for generated dumps
    #[serde(default = "default_dump_prefix")]
    pub dump_file_prefix: String,

    /// Directory for generated dumps (system temp dir when unset)
    #[serde(default)]
    pub dump_directory: Option<PathBuf>,

    /// Show message boxes for errors the user must see
    #[serde(default = "default_true")]
    pub interactive: bool,

    /// Exit code mapping
    #[serde(default)]
    pub exit_codes: ExitCodePolicy,

    /// Telemetry settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_object_prefix() -> String {
    DEFAULT_OBJECT_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

fn default_attach_timeout_ms() -> u64 {
    15_000
}

fn default_debug_poll_interval_ms() -> u64 {
    100
}

fn default_dump_prefix() -> String {
    "Watchdog.CrashReport".to_string()
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            object_prefix: default_object_prefix(),
            enforce_integrity: true,
            attach_debugger: false,
            debugger_attach_timeout_ms: default_attach_timeout_ms(),
            debug_poll_interval_ms: default_debug_poll_interval_ms(),
            report_tool: None,
            dump_file_prefix: default_dump_prefix(),
            dump_directory: None,
            interactive: true,
            exit_codes: ExitCodePolicy::default(),
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl WatchdogConfig {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("watchdog")
            .join("config.json")
    }

    /// Load configuration from an explicit file. The file must exist.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: WatchdogConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file at the default location, falling back to defaults when absent
    pub fn load_or_default() -> ConfigResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration as pretty-printed JSON
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> ConfigResult<()> {
        if self.object_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("object_prefix must not be empty".to_string()));
        }
        if self.debug_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "debug_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.telemetry.encrypt_payload && self.telemetry.payload_key.is_empty() {
            return Err(ConfigError::Invalid(
                "telemetry.payload_key is required when encrypt_payload is set".to_string(),
            ));
        }
        Ok(())
    }

    /// Attach-confirmation timeout
    pub fn debugger_attach_timeout(&self) -> Duration {
        Duration::from_millis(self.debugger_attach_timeout_ms)
    }

    /// Debug-event poll interval
    pub fn debug_poll_interval(&self) -> Duration {
        Duration::from_millis(self.debug_poll_interval_ms)
    }

    /// Directory that receives generated dumps
    pub fn dump_directory(&self) -> PathBuf {
        self.dump_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = WatchdogConfig::default();
        assert_eq!(config.object_prefix, "Local\\Watchdog");
        assert!(config.enforce_integrity);
        assert!(!config.attach_debugger);
        assert_eq!(config.debugger_attach_timeout(), Duration::from_secs(15));
        assert_eq!(config.debug_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.exit_codes, ExitCodePolicy::Compatible);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "attach_debugger": true, "exit_codes": "distinct" }"#).unwrap();

        let config = WatchdogConfig::load(&path).unwrap();
        assert!(config.attach_debugger);
        assert_eq!(config.exit_codes, ExitCodePolicy::Distinct);
        assert_eq!(config.dump_file_prefix, "Watchdog.CrashReport");
        assert!(!config.telemetry.encrypt_payload);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = WatchdogConfig::default();
        config.interactive = false;
        config.dump_directory = Some(dir.path().to_path_buf());
        config.save(&path).unwrap();

        let loaded = WatchdogConfig::load(&path).unwrap();
        assert!(!loaded.interactive);
        assert_eq!(loaded.dump_directory(), dir.path().to_path_buf());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let result = WatchdogConfig::load(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = WatchdogConfig::default();
        config.object_prefix = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = WatchdogConfig::default();
        config.debug_poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = WatchdogConfig::default();
        config.telemetry.encrypt_payload = true;
        config.telemetry.payload_key.clear();
        assert!(config.validate().is_err());
    }
}
