//! Watchdog Core Module
//!
//! Configuration, error taxonomy and small shared helpers.

pub mod config;
pub mod error;
pub mod utils;

pub use config::{ConfigError, ConfigResult, ExitCodePolicy, WatchdogConfig};
pub use error::{
    DebuggerError, DumpError, IntegrityError, LaunchError, ReportError, ResourceError, WaitError,
};
