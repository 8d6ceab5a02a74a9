//! Named waitable primitives and the multiplexed wait

use std::io;
use std::ptr;
use std::time::Duration;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{ERROR_ALREADY_EXISTS, HANDLE};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::System::Threading::{
    CreateEventW, CreateWaitableTimerW, OpenEventW, OpenWaitableTimerW, SetEvent,
    SetWaitableTimer, WaitForMultipleObjects, EVENT_MODIFY_STATE, TIMER_MODIFY_STATE,
};

use super::handle::{io_error, last_error, wide, OwnedHandle};
use crate::core::error::{ResourceError, WaitError};
use crate::watchdog::backend::Signal;

const INFINITE: u32 = u32::MAX;
const WAIT_OBJECT_0: u32 = 0;
const WAIT_ABANDONED_0: u32 = 0x80;
const WAIT_TIMEOUT: u32 = 0x102;

/// Heartbeat timer or crash event owned by the supervisor
pub struct NamedSignal {
    name: String,
    handle: OwnedHandle,
}

impl Signal for NamedSignal {
    type Waitable = HANDLE;

    fn name(&self) -> &str {
        &self.name
    }

    fn waitable(&self) -> HANDLE {
        self.handle.raw()
    }
}

fn inheritable() -> SECURITY_ATTRIBUTES {
    SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: true.into(),
    }
}

/// Manual-reset, inheritable waitable timer. It stays unsignalled until the
/// child first arms it.
pub fn create_heartbeat_timer(name: &str) -> Result<NamedSignal, ResourceError> {
    let wide_name = wide(name);
    let attributes = inheritable();

    let handle = unsafe {
        CreateWaitableTimerW(Some(&attributes as *const _), true, PCWSTR(wide_name.as_ptr()))
    }
    .map_err(|e| ResourceError::HeartbeatTimer(format!("{}: {}", name, e)))?;
    let existed = last_error() == ERROR_ALREADY_EXISTS.0;
    let handle = OwnedHandle::new(handle);

    if existed {
        return Err(ResourceError::HeartbeatTimerExists(name.to_string()));
    }
    Ok(NamedSignal {
        name: name.to_string(),
        handle,
    })
}

/// Manual-reset, inheritable, initially clear event
pub fn create_crash_event(name: &str) -> Result<NamedSignal, ResourceError> {
    let wide_name = wide(name);
    let attributes = inheritable();

    let handle = unsafe {
        CreateEventW(
            Some(&attributes as *const _),
            true,
            false,
            PCWSTR(wide_name.as_ptr()),
        )
    }
    .map_err(|e| ResourceError::CrashEvent(format!("{}: {}", name, e)))?;
    let existed = last_error() == ERROR_ALREADY_EXISTS.0;
    let handle = OwnedHandle::new(handle);

    if existed {
        return Err(ResourceError::CrashEventExists(name.to_string()));
    }
    Ok(NamedSignal {
        name: name.to_string(),
        handle,
    })
}

/// Block until one handle is signalled. The lowest signalled index wins.
pub fn wait_any(handles: &[HANDLE]) -> Result<usize, WaitError> {
    let result = unsafe { WaitForMultipleObjects(handles, false, INFINITE) }.0;
    let count = handles.len() as u32;

    match result {
        r if r < WAIT_OBJECT_0 + count => Ok((r - WAIT_OBJECT_0) as usize),
        r if (WAIT_ABANDONED_0..WAIT_ABANDONED_0 + count).contains(&r) => {
            Ok((r - WAIT_ABANDONED_0) as usize)
        }
        WAIT_TIMEOUT => Err(WaitError::TimedOut),
        _ => Err(WaitError::Failed(last_error())),
    }
}

/// Crash event opened from inside the target
pub struct NamedEvent {
    handle: OwnedHandle,
}

impl NamedEvent {
    /// Open an event the supervisor already created
    pub fn open(name: &str) -> io::Result<Self> {
        let wide_name = wide(name);
        let handle = unsafe { OpenEventW(EVENT_MODIFY_STATE, false, PCWSTR(wide_name.as_ptr())) }
            .map_err(io_error)?;
        Ok(Self {
            handle: OwnedHandle::new(handle),
        })
    }

    pub fn set(&self) -> io::Result<()> {
        unsafe { SetEvent(self.handle.raw()) }.map_err(io_error)
    }
}

/// Heartbeat timer opened from inside the target
pub struct WaitableTimer {
    handle: OwnedHandle,
}

impl WaitableTimer {
    pub fn open(name: &str) -> io::Result<Self> {
        let wide_name = wide(name);
        let handle =
            unsafe { OpenWaitableTimerW(TIMER_MODIFY_STATE, false, PCWSTR(wide_name.as_ptr())) }
                .map_err(io_error)?;
        Ok(Self {
            handle: OwnedHandle::new(handle),
        })
    }

    /// Push the deadline `period` into the future
    pub fn reset(&self, period: Duration) -> io::Result<()> {
        // negative due time is relative, in 100ns units
        let due = -((period.as_nanos() / 100).min(i64::MAX as u128) as i64);
        unsafe { SetWaitableTimer(self.handle.raw(), &due, 0, None, None, false) }.map_err(io_error)
    }
}
