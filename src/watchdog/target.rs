//! Cooperation API for the supervised application
//!
//! The child links against this module to find the supervisor that launched
//! it. The lookup runs in three steps:
//!
//! 1. parse `wseed <nonce>` from the command line
//! 2. read [`HiddenLaunchArgs`] from the segment named after its own pid and
//!    check the pid and nonce
//! 3. open the crash event and crash segment of that supervisor
//!
//! The crash channel is used only when both objects already exist. Without a
//! listening supervisor the child keeps normal OS fault handling.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use super::backend::ObjectNames;
use super::crash_relay::{CrashRecord, CRASH_RECORD_SIZE};
use super::launch_args::{find_seed, HiddenLaunchArgs, LAUNCH_ARGS_SEGMENT_SIZE};
use super::shared_memory::{open_shared_memory, SharedMemory, SharedMemoryError};
use crate::os::{current_thread_id, TargetEvent, TargetTimer};

/// Errors on the target side of the link
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Launch args belong to process {found}, not {expected}")]
    WrongProcess { expected: u32, found: u32 },

    #[error("Launch args nonce {found} does not match command line nonce {expected}")]
    NonceMismatch { expected: u32, found: u32 },

    #[error("Launch args unavailable: {0}")]
    LaunchArgs(#[from] SharedMemoryError),

    #[error("Crash relay failed: {0}")]
    Relay(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Check that launch args found in shared memory were written for us
pub fn verify_launch_args(
    args: &HiddenLaunchArgs,
    own_pid: u32,
    nonce: u32,
) -> Result<(), TargetError> {
    if args.child_pid != own_pid {
        return Err(TargetError::WrongProcess {
            expected: own_pid,
            found: args.child_pid,
        });
    }
    if args.nonce != nonce {
        return Err(TargetError::NonceMismatch {
            expected: nonce,
            found: args.nonce,
        });
    }
    Ok(())
}

/// Writer half of the crash-relay channel
pub struct CrashRelayClient {
    event: TargetEvent,
    segment: Box<dyn SharedMemory>,
}

impl CrashRelayClient {
    /// Open the supervisor's crash event and segment. Both must exist.
    pub fn open(names: &ObjectNames, supervisor_pid: u32) -> Result<Self, TargetError> {
        let event = TargetEvent::open(&names.crash_event(supervisor_pid))?;
        let segment = open_shared_memory(&names.crash_segment(supervisor_pid), CRASH_RECORD_SIZE)?;
        Ok(Self { event, segment })
    }

    /// Write `record`, then signal. The record must be complete before the
    /// event is set.
    pub fn relay(&self, record: &CrashRecord) -> Result<(), TargetError> {
        record
            .write_to(self.segment.as_ref())
            .map_err(|e| TargetError::Relay(e.to_string()))?;
        self.event.set().map_err(|e| TargetError::Relay(e.to_string()))
    }
}

/// Connection from a supervised child to its supervisor
pub struct WatchdogLink {
    launch: HiddenLaunchArgs,
    relay: Option<CrashRelayClient>,
    heartbeat: Option<TargetTimer>,
}

impl WatchdogLink {
    /// Connect using this process's own arguments.
    ///
    /// `Ok(None)` means the process was not started by a watchdog.
    pub fn connect(names: &ObjectNames) -> Result<Option<Self>, TargetError> {
        Self::connect_with_args(names, std::env::args())
    }

    pub fn connect_with_args<I, S>(names: &ObjectNames, args: I) -> Result<Option<Self>, TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(nonce) = find_seed(args) else {
            return Ok(None);
        };

        let own_pid = std::process::id();
        let segment = open_shared_memory(&names.launch_args(own_pid), LAUNCH_ARGS_SEGMENT_SIZE)?;
        let launch = HiddenLaunchArgs::read_from(segment.as_ref())?;
        verify_launch_args(&launch, own_pid, nonce)?;

        let relay = match CrashRelayClient::open(names, launch.supervisor_pid) {
            Ok(relay) => Some(relay),
            Err(e) => {
                tracing::warn!("Crash relay unavailable, using default fault handling: {}", e);
                None
            }
        };

        let heartbeat = match TargetTimer::open(&names.heartbeat_timer(launch.supervisor_pid)) {
            Ok(timer) => Some(timer),
            Err(e) => {
                tracing::debug!("Heartbeat timer unavailable: {}", e);
                None
            }
        };

        tracing::info!(
            "Connected to watchdog {} (relay: {}, heartbeat: {})",
            launch.supervisor_pid,
            relay.is_some(),
            heartbeat.is_some()
        );

        Ok(Some(Self {
            launch,
            relay,
            heartbeat,
        }))
    }

    pub fn supervisor_pid(&self) -> u32 {
        self.launch.supervisor_pid
    }

    pub fn nonce(&self) -> u32 {
        self.launch.nonce
    }

    pub fn has_crash_relay(&self) -> bool {
        self.relay.is_some()
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat.is_some()
    }

    /// Push the heartbeat deadline `period` into the future.
    /// A no-op when the supervisor runs without heartbeat monitoring.
    pub fn heartbeat(&self, period: Duration) -> Result<(), TargetError> {
        match self.heartbeat {
            Some(ref timer) => Ok(timer.reset(period)?),
            None => Ok(()),
        }
    }

    /// Hand a live fault to the supervisor. Returns whether it was relayed.
    pub fn relay_fault(&self, thread_id: u32, exception_pointers: u64) -> Result<bool, TargetError> {
        self.relay_record(&CrashRecord::fault(thread_id, exception_pointers))
    }

    /// Ask the supervisor to report a dump this process already wrote
    pub fn relay_prewritten_dump(&self, path: &Path) -> Result<bool, TargetError> {
        self.relay_record(&CrashRecord::prewritten_dump(path))
    }

    fn relay_record(&self, record: &CrashRecord) -> Result<bool, TargetError> {
        match self.relay {
            Some(ref relay) => relay.relay(record).map(|_| true),
            None => Ok(false),
        }
    }

    /// Route unhandled faults of this process to the supervisor.
    ///
    /// Panics and, on Windows, unhandled SEH exceptions write a crash record,
    /// signal and park the faulting thread until the supervisor terminates
    /// the process. The relay moves into the hook, so later `relay_*` calls
    /// return `false`. Returns `false` when there is no crash relay, or when
    /// a hook was already installed.
    pub fn install_fault_hook(&mut self) -> bool {
        let Some(relay) = self.relay.take() else {
            return false;
        };
        if FAULT_RELAY.set(relay).is_err() {
            return false;
        }

        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            previous(info);
            if let Some(relay) = FAULT_RELAY.get() {
                if relay.relay(&CrashRecord::fault(current_thread_id(), 0)).is_ok() {
                    park_forever();
                }
            }
        }));

        #[cfg(windows)]
        unsafe {
            let _ = windows::Win32::System::Diagnostics::Debug::SetUnhandledExceptionFilter(Some(
                relay_unhandled_exception,
            ));
        }

        true
    }
}

static FAULT_RELAY: OnceLock<CrashRelayClient> = OnceLock::new();

#[cfg(windows)]
unsafe extern "system" fn relay_unhandled_exception(
    pointers: *const windows::Win32::System::Diagnostics::Debug::EXCEPTION_POINTERS,
) -> i32 {
    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

    if let Some(relay) = FAULT_RELAY.get() {
        let record = CrashRecord::fault(current_thread_id(), pointers as usize as u64);
        if relay.relay(&record).is_ok() {
            park_forever();
        }
    }
    EXCEPTION_CONTINUE_SEARCH
}

/// Sleep until the supervisor kills the process
pub fn park_forever() -> ! {
    loop {
        std::thread::park();
    }
}
