//! Error types for the watchdog
//!
//! Each variant family maps onto one failure class of a supervision session:
//! launch, integrity, liveness/fault handling, resource creation and report
//! dispatch. Nothing here is propagated past the supervisor except through the
//! process exit code and the log/telemetry side channels.

use std::path::PathBuf;
use thiserror::Error;

use crate::watchdog::shared_memory::SharedMemoryError;

/// Win32 `ERROR_FILE_NOT_FOUND`
pub const OS_ERROR_FILE_NOT_FOUND: u32 = 2;
/// Win32 `ERROR_PATH_NOT_FOUND`
pub const OS_ERROR_PATH_NOT_FOUND: u32 = 3;
/// Win32 `ERROR_DIRECTORY`, reported when the working directory is invalid
pub const OS_ERROR_DIRECTORY: u32 = 267;
/// Win32 `ERROR_ALREADY_EXISTS`
pub const OS_ERROR_ALREADY_EXISTS: u32 = 183;

/// Errors starting the target process. No child exists after any of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Failed to find application file: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to find application path: {path}")]
    PathNotFound { path: PathBuf },

    #[error("Failed to find working directory: {path}")]
    WorkingDirectoryNotFound { path: PathBuf },

    #[error("Unhandled error starting application: {code} ({message})")]
    Os { code: u32, message: String },
}

impl LaunchError {
    /// Classify an OS error code returned by process creation
    pub fn from_os_code(
        code: u32,
        executable: &std::path::Path,
        working_dir: Option<&std::path::Path>,
        message: impl Into<String>,
    ) -> Self {
        match code {
            OS_ERROR_FILE_NOT_FOUND => LaunchError::FileNotFound {
                path: executable.to_path_buf(),
            },
            OS_ERROR_PATH_NOT_FOUND => LaunchError::PathNotFound {
                path: executable.to_path_buf(),
            },
            OS_ERROR_DIRECTORY => LaunchError::WorkingDirectoryNotFound {
                path: working_dir.map(|p| p.to_path_buf()).unwrap_or_default(),
            },
            _ => LaunchError::Os {
                code,
                message: message.into(),
            },
        }
    }

    /// Short tag written to the log next to the user-facing message
    pub fn tag(&self) -> &'static str {
        match self {
            LaunchError::FileNotFound { .. } => "ERROR_FILE_NOT_FOUND",
            LaunchError::PathNotFound { .. } => "ERROR_PATH_NOT_FOUND",
            LaunchError::WorkingDirectoryNotFound { .. } => "ERROR_DIRECTORY",
            LaunchError::Os { .. } => "ERROR_UNCLASSIFIED",
        }
    }
}

/// Executable integrity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Checksum mismatch: supplied {expected}, computed {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Failure to create one of the optional monitoring primitives
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Heartbeat timer could not be created: {0}")]
    HeartbeatTimer(String),

    #[error("Heartbeat timer already exists: {0}")]
    HeartbeatTimerExists(String),

    #[error("Crash event could not be created: {0}")]
    CrashEvent(String),

    #[error("Crash event already exists: {0}")]
    CrashEventExists(String),

    #[error("Shared segment could not be created: {0}")]
    Segment(#[from] SharedMemoryError),
}

/// Failure of the multiplexed wait
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("Wait failed with OS error {0}")]
    Failed(u32),

    #[error("Wait timed out")]
    TimedOut,

    #[error("Wait returned index {0} which maps to no signal source")]
    UnknownIndex(usize),
}

/// Failure to produce a diagnostic snapshot
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Failed to create dump file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Minidump facility failed: {0}")]
    WriteFailed(String),

    #[error("Crash record unavailable: {0}")]
    RecordUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure handing the dump to the external report tool
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Crash reporter not found at {path}")]
    ToolNotFound { path: PathBuf },

    #[error("Failed to start crash reporter: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Debugger session errors
#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("Failed to attach debugger: {0}")]
    AttachFailed(String),

    #[error("Debug event error: {0}")]
    Event(String),

    #[error("Debugger mode is not supported on {platform}")]
    Unsupported { platform: String },

    #[error("Failed to start debug worker: {0}")]
    Worker(#[from] std::io::Error),
}
