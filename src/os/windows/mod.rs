//! Win32 backend
//!
//! - Suspended process creation in a new console
//! - Waitable timer, manual-reset event and `WaitForMultipleObjects`
//! - Paging-file backed shared segments
//! - `MiniDumpWriteDump`
//! - Debug port for debugger mode
//! - Message boxes for errors the user must see

mod debug;
mod handle;
mod minidump;
mod process;
mod sync;

pub use debug::WindowsDebugPort;
pub use handle::OwnedHandle;
pub use process::{current_thread_id, WindowsChild};
pub use sync::{NamedEvent, NamedSignal, WaitableTimer};

use std::path::Path;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{HANDLE, HWND};
use windows::Win32::System::Environment::GetCommandLineW;
use windows::Win32::UI::WindowsAndMessaging::{MessageBoxW, MB_ICONERROR, MB_OK};

use crate::core::error::{DebuggerError, DumpError, LaunchError, ResourceError, WaitError};
use crate::watchdog::backend::{Backend, ChildProcess, LaunchRequest};
use crate::watchdog::dump::DumpContext;
use crate::watchdog::shared_memory::{SharedMemoryError, WindowsSharedMemory};

/// Caption of every message box
pub const MESSAGE_CAPTION: &str = "Watchdog";

/// The unparsed command line of this process, quotes included
pub fn raw_command_line() -> Option<String> {
    // Owned by the process, valid for its lifetime
    unsafe { GetCommandLineW().to_string().ok() }
}

/// Operating system services on Windows
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsBackend;

impl WindowsBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for WindowsBackend {
    type Waitable = HANDLE;
    type Child = WindowsChild;
    type Signal = NamedSignal;
    type Segment = WindowsSharedMemory;
    type Port = WindowsDebugPort;

    fn supervisor_pid(&self) -> u32 {
        std::process::id()
    }

    fn spawn_suspended(&self, request: &LaunchRequest<'_>) -> Result<WindowsChild, LaunchError> {
        process::spawn_suspended(request)
    }

    fn create_heartbeat_timer(&self, name: &str) -> Result<NamedSignal, ResourceError> {
        sync::create_heartbeat_timer(name)
    }

    fn create_crash_event(&self, name: &str) -> Result<NamedSignal, ResourceError> {
        sync::create_crash_event(name)
    }

    fn create_segment(
        &self,
        name: &str,
        size: usize,
        inheritable: bool,
    ) -> Result<WindowsSharedMemory, SharedMemoryError> {
        WindowsSharedMemory::create(name, size, inheritable)
    }

    fn wait_any(&self, handles: &[HANDLE]) -> Result<usize, WaitError> {
        sync::wait_any(handles)
    }

    fn write_dump(
        &self,
        child: &WindowsChild,
        path: &Path,
        context: &DumpContext,
    ) -> Result<(), DumpError> {
        minidump::write_minidump(child.process_handle(), child.pid(), path, context)
    }

    fn debug_port(&self) -> Result<WindowsDebugPort, DebuggerError> {
        Ok(WindowsDebugPort::new())
    }

    fn notify_user(&self, message: &str) {
        let text = handle::wide(message);
        let caption = handle::wide(MESSAGE_CAPTION);
        unsafe {
            MessageBoxW(
                HWND(0),
                PCWSTR(text.as_ptr()),
                PCWSTR(caption.as_ptr()),
                MB_OK | MB_ICONERROR,
            );
        }
    }
}
