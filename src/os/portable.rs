//! File-backed development backend
//!
//! Hosts without the Win32 primitives get a stand-in so the supervisor can be
//! exercised end to end. Every named object is a file under one root
//! directory:
//!
//! - events hold `0` or `1`
//! - timers hold a deadline in epoch milliseconds, `0` while unarmed
//! - segments are [`FileSharedMemory`] files
//!
//! The child cannot be created suspended, so it starts running immediately.
//! The wait polls every source in order and reports the lowest signalled index.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::core::error::{DebuggerError, DumpError, LaunchError, ResourceError, WaitError};
use crate::core::utils::{epoch_millis, sanitize_object_name};
use crate::watchdog::backend::{Backend, ChildProcess, LaunchRequest, Signal};
use crate::watchdog::debugger::{ContinueStatus, DebugEvent, DebugPort};
use crate::watchdog::dump::DumpContext;
use crate::watchdog::report::split_arguments;
use crate::watchdog::shared_memory::{default_object_root, FileSharedMemory, SharedMemoryError};

/// Default polling interval of [`PortableBackend::wait_any`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

const EVENT_EXTENSION: &str = "event";
const TIMER_EXTENSION: &str = "timer";

fn object_path(root: &Path, name: &str, extension: &str) -> PathBuf {
    root.join(format!("{}.{}", sanitize_object_name(name), extension))
}

/// Something the portable wait can poll
#[derive(Debug, Clone)]
pub enum PortableWaitable {
    Process(Arc<Mutex<Child>>),
    Event(PathBuf),
    Timer(PathBuf),
}

impl PortableWaitable {
    fn is_signalled(&self) -> io::Result<bool> {
        match self {
            PortableWaitable::Process(child) => Ok(child.lock().try_wait()?.is_some()),
            PortableWaitable::Event(path) => Ok(fs::read_to_string(path)?.trim() == "1"),
            PortableWaitable::Timer(path) => {
                let deadline: u64 = fs::read_to_string(path)?.trim().parse().unwrap_or(0);
                Ok(deadline != 0 && epoch_millis(SystemTime::now()) >= deadline)
            }
        }
    }
}

/// A running child. Dropping it does not kill the process.
pub struct PortableChild {
    pid: u32,
    process: Arc<Mutex<Child>>,
}

impl ChildProcess for PortableChild {
    type Waitable = PortableWaitable;

    fn pid(&self) -> u32 {
        self.pid
    }

    /// No thread ids here; the process id stands in for the main thread
    fn main_thread_id(&self) -> u32 {
        self.pid
    }

    fn resume(&mut self) -> io::Result<()> {
        tracing::debug!("Process {} was never suspended", self.pid);
        Ok(())
    }

    fn exit_code(&mut self) -> io::Result<Option<u32>> {
        let status = self.process.lock().try_wait()?;
        Ok(status.map(|s| s.code().unwrap_or(-1) as u32))
    }

    fn terminate(&mut self, exit_code: u32) -> io::Result<()> {
        tracing::debug!("Killing process {} (requested rc={})", self.pid, exit_code);
        let mut process = self.process.lock();
        if process.try_wait()?.is_some() {
            return Ok(());
        }
        process.kill()?;
        process.wait()?;
        Ok(())
    }

    fn waitable(&self) -> PortableWaitable {
        PortableWaitable::Process(Arc::clone(&self.process))
    }
}

/// Event or timer file owned by the supervisor; removed on drop
#[derive(Debug)]
pub struct FileSignal {
    name: String,
    waitable: PortableWaitable,
    path: PathBuf,
}

impl Signal for FileSignal {
    type Waitable = PortableWaitable;

    fn name(&self) -> &str {
        &self.name
    }

    fn waitable(&self) -> PortableWaitable {
        self.waitable.clone()
    }
}

impl Drop for FileSignal {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Debug port type for hosts without a debugger API. It cannot be constructed.
#[derive(Debug)]
pub enum NoDebugPort {}

impl DebugPort for NoDebugPort {
    fn attach(&mut self, _pid: u32) -> Result<(), DebuggerError> {
        match *self {}
    }

    fn next_event(&mut self, _timeout: Duration) -> Result<Option<DebugEvent>, DebuggerError> {
        match *self {}
    }

    fn continue_event(&mut self, _event: &DebugEvent, _status: ContinueStatus) -> Result<(), DebuggerError> {
        match *self {}
    }

    fn write_fault_dump(&mut self, _event: &DebugEvent, _path: &Path) -> Result<(), DumpError> {
        match *self {}
    }

    fn terminate(&mut self, _event: &DebugEvent, _exit_code: u32) -> Result<(), DebuggerError> {
        match *self {}
    }
}

/// JSON stand-in for a minidump
#[derive(Debug, Serialize)]
struct DumpSnapshot {
    pid: u32,
    thread_id: u32,
    context: &'static str,
    exception_pointers: Option<u64>,
    client_pointers: bool,
    written_at: DateTime<Utc>,
    /// `/proc/<pid>/status` where available
    status: Option<String>,
}

/// File-backed [`Backend`]
#[derive(Debug, Clone)]
pub struct PortableBackend {
    root: PathBuf,
    poll_interval: Duration,
}

impl Default for PortableBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PortableBackend {
    pub fn new() -> Self {
        Self::with_root(default_object_root())
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `<name>.<extension>` exclusively with `initial` content
    fn create_object(&self, name: &str, extension: &str, initial: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let path = object_path(&self.root, name, extension);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(initial.as_bytes())?;
        Ok(path)
    }

    fn check_launch_paths(request: &LaunchRequest<'_>) -> Result<(), LaunchError> {
        if let Some(dir) = request.working_dir {
            if !dir.is_dir() {
                return Err(LaunchError::WorkingDirectoryNotFound {
                    path: dir.to_path_buf(),
                });
            }
        }

        if !request.executable.is_file() {
            let parent_exists = request
                .executable
                .parent()
                .map(|p| p.as_os_str().is_empty() || p.is_dir())
                .unwrap_or(false);
            let path = request.executable.to_path_buf();
            return Err(if parent_exists {
                LaunchError::FileNotFound { path }
            } else {
                LaunchError::PathNotFound { path }
            });
        }
        Ok(())
    }
}

impl Backend for PortableBackend {
    type Waitable = PortableWaitable;
    type Child = PortableChild;
    type Signal = FileSignal;
    type Segment = FileSharedMemory;
    type Port = NoDebugPort;

    fn supervisor_pid(&self) -> u32 {
        std::process::id()
    }

    fn spawn_suspended(&self, request: &LaunchRequest<'_>) -> Result<PortableChild, LaunchError> {
        Self::check_launch_paths(request)?;

        // first token is the quoted executable itself
        let arguments = split_arguments(request.command_line);
        let mut command = Command::new(request.executable);
        command.args(arguments.iter().skip(1));
        if let Some(dir) = request.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| LaunchError::Os {
            code: e.raw_os_error().unwrap_or_default() as u32,
            message: e.to_string(),
        })?;

        Ok(PortableChild {
            pid: child.id(),
            process: Arc::new(Mutex::new(child)),
        })
    }

    fn create_heartbeat_timer(&self, name: &str) -> Result<FileSignal, ResourceError> {
        let path = self.create_object(name, TIMER_EXTENSION, "0").map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                ResourceError::HeartbeatTimerExists(name.to_string())
            } else {
                ResourceError::HeartbeatTimer(format!("{}: {}", name, e))
            }
        })?;

        Ok(FileSignal {
            name: name.to_string(),
            waitable: PortableWaitable::Timer(path.clone()),
            path,
        })
    }

    fn create_crash_event(&self, name: &str) -> Result<FileSignal, ResourceError> {
        let path = self.create_object(name, EVENT_EXTENSION, "0").map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                ResourceError::CrashEventExists(name.to_string())
            } else {
                ResourceError::CrashEvent(format!("{}: {}", name, e))
            }
        })?;

        Ok(FileSignal {
            name: name.to_string(),
            waitable: PortableWaitable::Event(path.clone()),
            path,
        })
    }

    fn create_segment(
        &self,
        name: &str,
        size: usize,
        _inheritable: bool,
    ) -> Result<FileSharedMemory, SharedMemoryError> {
        FileSharedMemory::create_in(&self.root, name, size)
    }

    fn wait_any(&self, handles: &[PortableWaitable]) -> Result<usize, WaitError> {
        loop {
            for (index, handle) in handles.iter().enumerate() {
                let signalled = handle
                    .is_signalled()
                    .map_err(|e| WaitError::Failed(e.raw_os_error().unwrap_or_default() as u32))?;
                if signalled {
                    return Ok(index);
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn write_dump(
        &self,
        child: &PortableChild,
        path: &Path,
        context: &DumpContext,
    ) -> Result<(), DumpError> {
        let snapshot = DumpSnapshot {
            pid: child.pid(),
            thread_id: context.thread_id(),
            context: context.kind(),
            exception_pointers: context.exception_pointers(),
            client_pointers: context.client_pointers(),
            written_at: Utc::now(),
            status: fs::read_to_string(format!("/proc/{}/status", child.pid())).ok(),
        };

        let file = fs::File::create(path).map_err(|source| DumpError::CreateFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::to_writer_pretty(file, &snapshot)?;
        Ok(())
    }

    fn debug_port(&self) -> Result<NoDebugPort, DebuggerError> {
        Err(DebuggerError::Unsupported {
            platform: std::env::consts::OS.to_string(),
        })
    }

    fn notify_user(&self, message: &str) {
        // no message box on this host; the notifier has already logged it
        tracing::debug!("Notification not shown: {}", message);
    }
}

/// Crash event opened from inside the target
#[derive(Debug)]
pub struct FileEvent {
    path: PathBuf,
}

impl FileEvent {
    pub fn open(name: &str) -> io::Result<Self> {
        Self::open_in(&default_object_root(), name)
    }

    /// Open an event file that must already exist
    pub fn open_in(root: &Path, name: &str) -> io::Result<Self> {
        let path = object_path(root, name, EVENT_EXTENSION);
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no event named {}", name),
            ));
        }
        Ok(Self { path })
    }

    pub fn set(&self) -> io::Result<()> {
        fs::write(&self.path, "1")
    }
}

/// Heartbeat timer opened from inside the target
#[derive(Debug)]
pub struct FileTimer {
    path: PathBuf,
}

impl FileTimer {
    pub fn open(name: &str) -> io::Result<Self> {
        Self::open_in(&default_object_root(), name)
    }

    pub fn open_in(root: &Path, name: &str) -> io::Result<Self> {
        let path = object_path(root, name, TIMER_EXTENSION);
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no timer named {}", name),
            ));
        }
        Ok(Self { path })
    }

    /// Push the deadline `period` into the future
    pub fn reset(&self, period: Duration) -> io::Result<()> {
        let deadline = epoch_millis(SystemTime::now() + period).max(1);
        fs::write(&self.path, deadline.to_string())
    }
}

/// No portable thread id; the process id names the main thread on Linux
pub fn current_thread_id() -> u32 {
    std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> PortableBackend {
        PortableBackend::with_root(dir.path()).with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_event_is_exclusive_and_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);

        let event = backend.create_crash_event("Local\\W-1-Crashed").unwrap();
        assert!(matches!(
            backend.create_crash_event("Local\\W-1-Crashed"),
            Err(ResourceError::CrashEventExists(_))
        ));

        drop(event);
        assert!(backend.create_crash_event("Local\\W-1-Crashed").is_ok());
    }

    #[test]
    fn test_timer_exists() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let _timer = backend.create_heartbeat_timer("T").unwrap();
        assert!(matches!(
            backend.create_heartbeat_timer("T"),
            Err(ResourceError::HeartbeatTimerExists(_))
        ));
    }

    #[test]
    fn test_wait_reports_lowest_signalled_index() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let timer = backend.create_heartbeat_timer("T").unwrap();
        let event = backend.create_crash_event("E").unwrap();

        FileEvent::open_in(dir.path(), "E").unwrap().set().unwrap();
        let handles = [timer.waitable(), event.waitable()];
        assert_eq!(backend.wait_any(&handles), Ok(1));

        FileTimer::open_in(dir.path(), "T")
            .unwrap()
            .reset(Duration::ZERO)
            .unwrap();
        assert_eq!(backend.wait_any(&handles), Ok(0));
    }

    #[test]
    fn test_unarmed_timer_does_not_fire() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let timer = backend.create_heartbeat_timer("T").unwrap();
        assert!(!timer.waitable().is_signalled().unwrap());

        FileTimer::open_in(dir.path(), "T")
            .unwrap()
            .reset(Duration::from_secs(60))
            .unwrap();
        assert!(!timer.waitable().is_signalled().unwrap());
    }

    #[test]
    fn test_open_missing_objects() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            FileEvent::open_in(dir.path(), "missing").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert!(FileTimer::open_in(dir.path(), "missing").is_err());
    }

    #[test]
    fn test_launch_classification() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let exe = dir.path().join("game.exe");
        fs::write(&exe, b"MZ").unwrap();

        let missing_dir = dir.path().join("nowhere");
        let request = LaunchRequest {
            executable: &exe,
            command_line: "\"game.exe\"",
            working_dir: Some(&missing_dir),
        };
        assert_eq!(
            backend.spawn_suspended(&request).err(),
            Some(LaunchError::WorkingDirectoryNotFound { path: missing_dir.clone() })
        );

        let missing_exe = dir.path().join("other.exe");
        let request = LaunchRequest {
            executable: &missing_exe,
            command_line: "\"other.exe\"",
            working_dir: None,
        };
        assert_eq!(
            backend.spawn_suspended(&request).err(),
            Some(LaunchError::FileNotFound { path: missing_exe.clone() })
        );

        let deep = dir.path().join("no").join("such").join("game.exe");
        let request = LaunchRequest {
            executable: &deep,
            command_line: "\"game.exe\"",
            working_dir: None,
        };
        assert_eq!(
            backend.spawn_suspended(&request).err(),
            Some(LaunchError::PathNotFound { path: deep.clone() })
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_and_wait_for_exit() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let exe = PathBuf::from("/bin/echo");
        if !exe.is_file() {
            return;
        }

        let request = LaunchRequest {
            executable: &exe,
            command_line: "\"/bin/echo\" \"wseed 1\"",
            working_dir: None,
        };
        let mut child = backend.spawn_suspended(&request).unwrap();
        child.resume().unwrap();

        assert_eq!(backend.wait_any(&[child.waitable()]), Ok(0));
        assert_eq!(child.exit_code().unwrap(), Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_dump_is_json() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let exe = PathBuf::from("/bin/echo");
        if !exe.is_file() {
            return;
        }
        let request = LaunchRequest {
            executable: &exe,
            command_line: "\"/bin/echo\"",
            working_dir: None,
        };
        let child = backend.spawn_suspended(&request).unwrap();

        let path = dir.path().join("snap.dmp");
        backend
            .write_dump(&child, &path, &DumpContext::EnvironmentOnly { thread_id: 9 })
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["thread_id"], 9);
        assert_eq!(value["context"], "environment");
        assert!(value["exception_pointers"].is_null());
    }

    #[test]
    fn test_debugger_unsupported() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            backend(&dir).debug_port(),
            Err(DebuggerError::Unsupported { .. })
        ));
    }
}
