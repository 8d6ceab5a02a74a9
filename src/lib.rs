//! Watchdog - process supervisor with crash diagnosis
//!
//! This crate provides:
//! - Launching a target application suspended with hidden launch arguments
//! - Heartbeat, crash-relay and debugger based failure detection
//! - Minidump generation and crash report dispatch
//! - SHA-1 integrity check of the target executable
//! - Telemetry for integrity failures
//! - The cooperation API linked into the supervised application

pub mod core;
pub mod integrity;
pub mod logging;
pub mod obfuscation;
pub mod os;
pub mod telemetry;
pub mod watchdog;

// Re-export commonly used items
pub use crate::core::config::{ExitCodePolicy, WatchdogConfig};
pub use crate::os::{native_backend, NativeBackend};
pub use crate::watchdog::{ExitOutcome, LaunchSpec, Supervisor, WatchdogLink};
