//! Win32 debug port
//!
//! Wraps `DebugActiveProcess` / `WaitForDebugEvent` / `ContinueDebugEvent`.
//! Every call must come from the thread that attached.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use windows::Win32::Foundation::{
    CloseHandle, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, ERROR_SEM_TIMEOUT, HANDLE,
};
use windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, DebugSetProcessKillOnExit,
    GetThreadContext, WaitForDebugEvent, CONTEXT, CONTEXT_FLAGS, CREATE_PROCESS_DEBUG_EVENT,
    CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT, EXCEPTION_POINTERS,
    EXCEPTION_RECORD, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
    OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use windows::Win32::System::Threading::{
    OpenProcess, OpenThread, TerminateProcess, PROCESS_ALL_ACCESS, PROCESS_TERMINATE,
    THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION,
};

use super::handle::{win32_code, OwnedHandle};
use super::minidump::write_minidump;
use crate::core::error::{DebuggerError, DumpError};
use crate::watchdog::debugger::{ContinueStatus, DebugEvent, DebugEventKind, DebugPort};
use crate::watchdog::dump::DumpContext;

#[cfg(target_arch = "x86_64")]
const CONTEXT_FULL: CONTEXT_FLAGS =
    windows::Win32::System::Diagnostics::Debug::CONTEXT_FULL_AMD64;
#[cfg(target_arch = "x86")]
const CONTEXT_FULL: CONTEXT_FLAGS = windows::Win32::System::Diagnostics::Debug::CONTEXT_FULL_X86;
#[cfg(target_arch = "aarch64")]
const CONTEXT_FULL: CONTEXT_FLAGS =
    windows::Win32::System::Diagnostics::Debug::CONTEXT_FULL_ARM64;

/// Debug port bound to the worker thread that attaches
#[derive(Default)]
pub struct WindowsDebugPort {
    pid: Option<u32>,
    exited: bool,
    /// Last exception record seen per thread
    exceptions: HashMap<u32, EXCEPTION_RECORD>,
}

// SAFETY: the stored exception records are plain copies whose pointers are
// only handed back to dbghelp, never dereferenced here
unsafe impl Send for WindowsDebugPort {}

impl WindowsDebugPort {
    pub fn new() -> Self {
        Self::default()
    }

    fn translate(&mut self, raw: &DEBUG_EVENT) -> DebugEvent {
        let code = raw.dwDebugEventCode;
        let kind = unsafe {
            if code == EXCEPTION_DEBUG_EVENT {
                let info = raw.u.Exception;
                let record = info.ExceptionRecord;
                self.exceptions.insert(raw.dwThreadId, record);
                DebugEventKind::Exception {
                    code: record.ExceptionCode.0 as u32,
                    address: record.ExceptionAddress as u64,
                    first_chance: info.dwFirstChance != 0,
                }
            } else if code == CREATE_PROCESS_DEBUG_EVENT {
                let info = raw.u.CreateProcessInfo;
                close_file(info.hFile);
                DebugEventKind::CreateProcess {
                    image_base: info.lpBaseOfImage as u64,
                }
            } else if code == EXIT_PROCESS_DEBUG_EVENT {
                self.exited = true;
                DebugEventKind::ExitProcess {
                    exit_code: raw.u.ExitProcess.dwExitCode,
                }
            } else if code == CREATE_THREAD_DEBUG_EVENT {
                DebugEventKind::CreateThread {
                    start_address: raw
                        .u
                        .CreateThread
                        .lpStartAddress
                        .map(|f| f as usize as u64)
                        .unwrap_or(0),
                }
            } else if code == EXIT_THREAD_DEBUG_EVENT {
                self.exceptions.remove(&raw.dwThreadId);
                DebugEventKind::ExitThread {
                    exit_code: raw.u.ExitThread.dwExitCode,
                }
            } else if code == LOAD_DLL_DEBUG_EVENT {
                let info = raw.u.LoadDll;
                close_file(info.hFile);
                DebugEventKind::LoadDll {
                    base: info.lpBaseOfDll as u64,
                }
            } else if code == UNLOAD_DLL_DEBUG_EVENT {
                DebugEventKind::UnloadDll {
                    base: raw.u.UnloadDll.lpBaseOfDll as u64,
                }
            } else if code == OUTPUT_DEBUG_STRING_EVENT {
                DebugEventKind::OutputString {
                    length: raw.u.DebugString.nDebugStringLength,
                }
            } else if code == RIP_EVENT {
                DebugEventKind::Rip {
                    error: raw.u.RipInfo.dwError,
                }
            } else {
                DebugEventKind::Other { code: code.0 }
            }
        };

        DebugEvent {
            process_id: raw.dwProcessId,
            thread_id: raw.dwThreadId,
            kind,
        }
    }
}

/// File handles delivered with debug events belong to the debugger
fn close_file(handle: HANDLE) {
    if !handle.is_invalid() {
        unsafe {
            let _ = CloseHandle(handle);
        }
    }
}

impl DebugPort for WindowsDebugPort {
    fn attach(&mut self, pid: u32) -> Result<(), DebuggerError> {
        unsafe { DebugActiveProcess(pid) }.map_err(|e| {
            DebuggerError::AttachFailed(format!(
                "Call to DebugActiveProcess failed : {}",
                win32_code(&e)
            ))
        })?;

        // leaving the debugger must not take the child down with it
        if let Err(e) = unsafe { DebugSetProcessKillOnExit(false) } {
            tracing::warn!("DebugSetProcessKillOnExit failed: {}", e);
        }
        self.pid = Some(pid);
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, DebuggerError> {
        let mut raw = DEBUG_EVENT::default();
        let millis = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;

        match unsafe { WaitForDebugEvent(&mut raw, millis) } {
            Ok(()) => Ok(Some(self.translate(&raw))),
            Err(e) if win32_code(&e) == ERROR_SEM_TIMEOUT.0 => Ok(None),
            Err(e) => Err(DebuggerError::Event(e.to_string())),
        }
    }

    fn continue_event(&mut self, event: &DebugEvent, status: ContinueStatus) -> Result<(), DebuggerError> {
        let status = match status {
            ContinueStatus::Continue => DBG_CONTINUE,
            ContinueStatus::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
        };
        unsafe { ContinueDebugEvent(event.process_id, event.thread_id, status) }
            .map_err(|e| DebuggerError::Event(e.to_string()))
    }

    fn write_fault_dump(&mut self, event: &DebugEvent, path: &Path) -> Result<(), DumpError> {
        let mut record = self.exceptions.get(&event.thread_id).copied().ok_or_else(|| {
            DumpError::RecordUnavailable(format!("no exception seen on thread {}", event.thread_id))
        })?;

        let process = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, event.process_id) }
            .map(OwnedHandle::new)
            .map_err(|e| DumpError::WriteFailed(format!("OpenProcess: {}", e)))?;
        let thread = unsafe {
            OpenThread(
                THREAD_GET_CONTEXT | THREAD_QUERY_INFORMATION,
                false,
                event.thread_id,
            )
        }
        .map(OwnedHandle::new)
        .map_err(|e| DumpError::WriteFailed(format!("OpenThread: {}", e)))?;

        let mut context = CONTEXT {
            ContextFlags: CONTEXT_FULL,
            ..Default::default()
        };
        unsafe { GetThreadContext(thread.raw(), &mut context) }
            .map_err(|e| DumpError::WriteFailed(format!("GetThreadContext: {}", e)))?;

        let pointers = EXCEPTION_POINTERS {
            ExceptionRecord: &mut record,
            ContextRecord: &mut context,
        };
        let context = DumpContext::Local {
            thread_id: event.thread_id,
            exception_pointers: &pointers as *const EXCEPTION_POINTERS as usize,
        };

        write_minidump(process.raw(), event.process_id, path, &context)
    }

    fn terminate(&mut self, event: &DebugEvent, exit_code: u32) -> Result<(), DebuggerError> {
        let process = unsafe { OpenProcess(PROCESS_TERMINATE, false, event.process_id) }
            .map(OwnedHandle::new)
            .map_err(|e| DebuggerError::Event(format!("OpenProcess: {}", e)))?;
        unsafe { TerminateProcess(process.raw(), exit_code) }
            .map_err(|e| DebuggerError::Event(format!("TerminateProcess: {}", e)))
    }
}

impl Drop for WindowsDebugPort {
    fn drop(&mut self) {
        if let (Some(pid), false) = (self.pid, self.exited) {
            if let Err(e) = unsafe { DebugActiveProcessStop(pid) } {
                tracing::debug!("DebugActiveProcessStop failed: {}", e);
            }
        }
    }
}
