//! Suspended child creation

use std::io;
use std::mem::size_of;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Threading::{
    CreateProcessW, GetCurrentThreadId, GetExitCodeProcess, ResumeThread, TerminateProcess,
    CREATE_NEW_CONSOLE, CREATE_SUSPENDED, PROCESS_INFORMATION, STARTUPINFOW,
};

use super::handle::{io_error, wide, wide_os, win32_code, OwnedHandle};
use crate::core::error::LaunchError;
use crate::watchdog::backend::{ChildProcess, LaunchRequest};

/// `STILL_ACTIVE`, reported as exit code while the process runs
const STILL_ACTIVE_CODE: u32 = 259;

/// A child process and its primary thread
pub struct WindowsChild {
    process: OwnedHandle,
    thread: OwnedHandle,
    pid: u32,
    tid: u32,
}

impl WindowsChild {
    pub fn process_handle(&self) -> HANDLE {
        self.process.raw()
    }
}

/// Create the child suspended in a new console, inheriting our inheritable
/// handles
pub fn spawn_suspended(request: &LaunchRequest<'_>) -> Result<WindowsChild, LaunchError> {
    let application = wide_os(request.executable.as_os_str());
    let mut command_line = wide(request.command_line);
    let working_dir = request.working_dir.map(|dir| wide_os(dir.as_os_str()));

    let startup = STARTUPINFOW {
        cb: size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    let mut info = PROCESS_INFORMATION::default();

    let created = unsafe {
        CreateProcessW(
            PCWSTR(application.as_ptr()),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            true,
            CREATE_NEW_CONSOLE | CREATE_SUSPENDED,
            None,
            working_dir
                .as_ref()
                .map(|dir| PCWSTR(dir.as_ptr()))
                .unwrap_or(PCWSTR::null()),
            &startup,
            &mut info,
        )
    };

    if let Err(e) = created {
        return Err(LaunchError::from_os_code(
            win32_code(&e),
            request.executable,
            request.working_dir,
            e.message().to_string(),
        ));
    }

    Ok(WindowsChild {
        process: OwnedHandle::new(info.hProcess),
        thread: OwnedHandle::new(info.hThread),
        pid: info.dwProcessId,
        tid: info.dwThreadId,
    })
}

impl ChildProcess for WindowsChild {
    type Waitable = HANDLE;

    fn pid(&self) -> u32 {
        self.pid
    }

    fn main_thread_id(&self) -> u32 {
        self.tid
    }

    fn resume(&mut self) -> io::Result<()> {
        if unsafe { ResumeThread(self.thread.raw()) } == u32::MAX {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn exit_code(&mut self) -> io::Result<Option<u32>> {
        let mut code = 0u32;
        unsafe { GetExitCodeProcess(self.process.raw(), &mut code) }.map_err(io_error)?;
        Ok((code != STILL_ACTIVE_CODE).then_some(code))
    }

    fn terminate(&mut self, exit_code: u32) -> io::Result<()> {
        unsafe { TerminateProcess(self.process.raw(), exit_code) }.map_err(io_error)
    }

    fn waitable(&self) -> HANDLE {
        self.process.raw()
    }
}

pub fn current_thread_id() -> u32 {
    unsafe { GetCurrentThreadId() }
}
