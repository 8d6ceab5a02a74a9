//! Platform seam for the supervisor
//!
//! Everything that touches the operating system goes through [`Backend`]:
//! process creation, the waitable primitives, shared segments, the multiplexed
//! wait and the dump writer. The supervisor logic above it is platform free.

use std::path::Path;

use super::debugger::DebugPort;
use super::dump::DumpContext;
use super::shared_memory::{SharedMemory, SharedMemoryError};
use crate::core::error::{DebuggerError, DumpError, LaunchError, ResourceError, WaitError};

/// Default namespace for named kernel objects
pub const DEFAULT_OBJECT_PREFIX: &str = "Local\\Watchdog";

/// Derives deterministic object names from process ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    prefix: String,
}

impl ObjectNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn heartbeat_timer(&self, supervisor_pid: u32) -> String {
        format!("{}-{}-Heartbeat", self.prefix, supervisor_pid)
    }

    pub fn crash_event(&self, supervisor_pid: u32) -> String {
        format!("{}-{}-Crashed", self.prefix, supervisor_pid)
    }

    pub fn crash_segment(&self, supervisor_pid: u32) -> String {
        format!("{}-{}-CrashRecord", self.prefix, supervisor_pid)
    }

    pub fn launch_args(&self, child_pid: u32) -> String {
        format!("{}-{}-Args", self.prefix, child_pid)
    }
}

impl Default for ObjectNames {
    fn default() -> Self {
        Self::new(DEFAULT_OBJECT_PREFIX)
    }
}

/// Parameters for creating the child
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub executable: &'a Path,
    /// Full command line, first token is the quoted executable path
    pub command_line: &'a str,
    pub working_dir: Option<&'a Path>,
}

/// A child created suspended. Dropping it releases the process and thread
/// handles without terminating the process.
pub trait ChildProcess: Send {
    type Waitable: Clone;

    fn pid(&self) -> u32;

    fn main_thread_id(&self) -> u32;

    /// Let the primary thread run
    fn resume(&mut self) -> std::io::Result<()>;

    /// `Some(code)` once the process has exited
    fn exit_code(&mut self) -> std::io::Result<Option<u32>>;

    fn terminate(&mut self, exit_code: u32) -> std::io::Result<()>;

    /// Handle signalled when the process exits
    fn waitable(&self) -> Self::Waitable;
}

/// A named waitable primitive: the heartbeat timer or the crash event
pub trait Signal: Send {
    type Waitable: Clone;

    fn name(&self) -> &str;

    fn waitable(&self) -> Self::Waitable;
}

/// Operating system services used by a supervision session
pub trait Backend: Send + Sync {
    type Waitable: Clone + Send;
    type Child: ChildProcess<Waitable = Self::Waitable>;
    type Signal: Signal<Waitable = Self::Waitable>;
    type Segment: SharedMemory;
    type Port: DebugPort + 'static;

    /// Our own process id
    fn supervisor_pid(&self) -> u32;

    /// Create the child suspended in a new console, inheriting handles
    fn spawn_suspended(&self, request: &LaunchRequest<'_>) -> Result<Self::Child, LaunchError>;

    /// Manual-reset, inheritable timer the child keeps pushing forward
    fn create_heartbeat_timer(&self, name: &str) -> Result<Self::Signal, ResourceError>;

    /// Manual-reset, inheritable event. Fails if the name is already taken.
    fn create_crash_event(&self, name: &str) -> Result<Self::Signal, ResourceError>;

    fn create_segment(
        &self,
        name: &str,
        size: usize,
        inheritable: bool,
    ) -> Result<Self::Segment, SharedMemoryError>;

    /// Block with no timeout until one of `handles` is signalled; returns its index
    fn wait_any(&self, handles: &[Self::Waitable]) -> Result<usize, WaitError>;

    /// Write a diagnostic snapshot of `child` to `path`
    fn write_dump(
        &self,
        child: &Self::Child,
        path: &Path,
        context: &DumpContext,
    ) -> Result<(), DumpError>;

    /// Debug port for debugger mode
    fn debug_port(&self) -> Result<Self::Port, DebuggerError>;

    /// Tell the user about a failure
    fn notify_user(&self, message: &str);
}
