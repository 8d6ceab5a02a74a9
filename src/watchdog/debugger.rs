//! Debugger Session
//!
//! Alternate monitoring mode: a worker thread attaches as the OS debugger of
//! the child and polls for debug events. The event classification is an
//! explicit state machine:
//!
//! ```text
//! Attaching --CreateProcess--> AwaitingInitialBreakpoint
//! AwaitingInitialBreakpoint --first-chance breakpoint / confirm attach--> Live
//! Live --first-chance breakpoint--> Stopping (dump, terminate)
//! any --second-chance exception--> Stopping (dump, terminate)
//! any --ExitProcess--> Stopping
//! ```
//!
//! Other first-chance exceptions are continued "not handled" so the target's
//! own handlers run first. They never produce a dump by themselves.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use super::dump::{DumpGenerator, GeneratedDump};
use super::report::{Notify, ReportContext};
use crate::core::error::{DebuggerError, DumpError};

/// `EXCEPTION_BREAKPOINT`
pub const EXCEPTION_BREAKPOINT_CODE: u32 = 0x8000_0003;

/// Exit code used when the debugger terminates a faulted target
pub const FAULT_EXIT_CODE: u32 = 1;

/// Platform-neutral debug event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEventKind {
    CreateProcess { image_base: u64 },
    ExitProcess { exit_code: u32 },
    CreateThread { start_address: u64 },
    ExitThread { exit_code: u32 },
    LoadDll { base: u64 },
    UnloadDll { base: u64 },
    OutputString { length: u16 },
    Rip { error: u32 },
    Exception {
        code: u32,
        address: u64,
        first_chance: bool,
    },
    /// Event code this build does not know
    Other { code: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    pub process_id: u32,
    pub thread_id: u32,
    pub kind: DebugEventKind,
}

/// How the debuggee continues after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueStatus {
    Continue,
    NotHandled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerState {
    Attaching,
    AwaitingInitialBreakpoint,
    Live,
    Stopping,
}

/// What the worker does with one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub continue_status: ContinueStatus,
    pub confirm_attach: bool,
    pub dump_and_terminate: bool,
}

impl Decision {
    fn proceed() -> Self {
        Self {
            continue_status: ContinueStatus::Continue,
            confirm_attach: false,
            dump_and_terminate: false,
        }
    }

    fn not_handled() -> Self {
        Self {
            continue_status: ContinueStatus::NotHandled,
            ..Self::proceed()
        }
    }

    fn fatal() -> Self {
        Self {
            continue_status: ContinueStatus::NotHandled,
            confirm_attach: false,
            dump_and_terminate: true,
        }
    }
}

/// Event classification for one debuggee
#[derive(Debug)]
pub struct DebugStateMachine {
    state: DebuggerState,
    attach_confirmed: bool,
}

impl Default for DebugStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugStateMachine {
    pub fn new() -> Self {
        Self {
            state: DebuggerState::Attaching,
            attach_confirmed: false,
        }
    }

    pub fn state(&self) -> DebuggerState {
        self.state
    }

    pub fn attach_confirmed(&self) -> bool {
        self.attach_confirmed
    }

    pub fn on_event(&mut self, kind: &DebugEventKind) -> Decision {
        match kind {
            DebugEventKind::CreateProcess { .. } => {
                if self.state == DebuggerState::Attaching {
                    self.state = DebuggerState::AwaitingInitialBreakpoint;
                }
                Decision::proceed()
            }
            DebugEventKind::ExitProcess { .. } => {
                self.state = DebuggerState::Stopping;
                Decision::proceed()
            }
            DebugEventKind::Exception {
                code,
                first_chance: true,
                ..
            } if *code == EXCEPTION_BREAKPOINT_CODE => self.on_breakpoint(),
            DebugEventKind::Exception {
                first_chance: true, ..
            } => Decision::not_handled(),
            DebugEventKind::Exception {
                first_chance: false,
                ..
            } => {
                if self.state == DebuggerState::Stopping {
                    return Decision::not_handled();
                }
                self.state = DebuggerState::Stopping;
                Decision::fatal()
            }
            _ => Decision::proceed(),
        }
    }

    fn on_breakpoint(&mut self) -> Decision {
        match self.state {
            DebuggerState::AwaitingInitialBreakpoint => {
                self.state = DebuggerState::Live;
                let decision = Decision {
                    confirm_attach: !self.attach_confirmed,
                    ..Decision::proceed()
                };
                self.attach_confirmed = true;
                decision
            }
            // the loader breakpoint can only follow create-process
            DebuggerState::Attaching => Decision::proceed(),
            DebuggerState::Live => {
                self.state = DebuggerState::Stopping;
                Decision::fatal()
            }
            DebuggerState::Stopping => Decision::proceed(),
        }
    }
}

/// OS debugging primitives used by the worker thread.
///
/// All calls happen on the worker thread, which is the thread that attached.
pub trait DebugPort: Send {
    fn attach(&mut self, pid: u32) -> Result<(), DebuggerError>;

    /// Wait up to `timeout` for the next event
    fn next_event(&mut self, timeout: Duration) -> Result<Option<DebugEvent>, DebuggerError>;

    fn continue_event(&mut self, event: &DebugEvent, status: ContinueStatus) -> Result<(), DebuggerError>;

    /// Dump the debuggee using the faulting thread's captured context
    fn write_fault_dump(&mut self, event: &DebugEvent, path: &Path) -> Result<(), DumpError>;

    fn terminate(&mut self, event: &DebugEvent, exit_code: u32) -> Result<(), DebuggerError>;
}

/// Outcome of waiting for the attach confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStatus {
    Attached,
    Failed,
    TimedOut,
}

/// What the worker needs to handle a fatal exception on its own
#[derive(Clone)]
pub struct FaultHandling {
    pub dumps: DumpGenerator,
    pub report: ReportContext,
    pub notify: Notify,
}

/// Background debug worker for one child.
///
/// Dropping the session asks the loop to stop, joins it, and only then
/// releases the attach-confirmation channel.
pub struct DebuggerSession {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    fatal_dump: Arc<Mutex<Option<GeneratedDump>>>,
    attached: Option<Receiver<bool>>,
}

impl DebuggerSession {
    /// Spawn the worker; it attaches to `pid` from its own thread
    pub fn start<P: DebugPort + 'static>(
        port: P,
        pid: u32,
        poll_interval: Duration,
        faults: FaultHandling,
        dispatch: tracing::Dispatch,
    ) -> Result<Self, DebuggerError> {
        let (attached_tx, attached_rx) = mpsc::sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));
        let fatal_dump = Arc::new(Mutex::new(None));

        let worker = {
            let stop = Arc::clone(&stop);
            let fatal_dump = Arc::clone(&fatal_dump);
            std::thread::Builder::new()
                .name("watchdog-debugger".to_string())
                .spawn(move || {
                    tracing::dispatcher::with_default(&dispatch, || {
                        let mut worker = DebugWorker {
                            port,
                            machine: DebugStateMachine::new(),
                            faults,
                            fatal_dump,
                        };
                        worker.run(pid, poll_interval, &stop, attached_tx);
                    })
                })?
        };

        Ok(Self {
            stop,
            worker: Some(worker),
            fatal_dump,
            attached: Some(attached_rx),
        })
    }

    /// Block until the worker has seen create-process and the initial
    /// breakpoint, it failed to attach, or `timeout` passes
    pub fn wait_for_attach(&self, timeout: Duration) -> AttachStatus {
        let Some(ref attached) = self.attached else {
            return AttachStatus::Failed;
        };

        match attached.recv_timeout(timeout) {
            Ok(true) => AttachStatus::Attached,
            Ok(false) | Err(RecvTimeoutError::Disconnected) => AttachStatus::Failed,
            Err(RecvTimeoutError::Timeout) => AttachStatus::TimedOut,
        }
    }

    /// Dump written by the worker for a fatal exception, if any
    pub fn fatal_dump(&self) -> Option<GeneratedDump> {
        self.fatal_dump.lock().clone()
    }
}

impl Drop for DebuggerSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Debugger worker panicked");
            }
        }
        self.attached.take();
    }
}

struct DebugWorker<P> {
    port: P,
    machine: DebugStateMachine,
    faults: FaultHandling,
    fatal_dump: Arc<Mutex<Option<GeneratedDump>>>,
}

impl<P: DebugPort> DebugWorker<P> {
    fn run(&mut self, pid: u32, poll_interval: Duration, stop: &AtomicBool, attached: SyncSender<bool>) {
        if let Err(e) = self.port.attach(pid) {
            tracing::error!("{}", e);
            (self.faults.notify)(&e.to_string());
            let _ = attached.send(false);
            return;
        }
        tracing::info!("Debugger attached to process {}", pid);

        let mut process_exited = false;
        while !stop.load(Ordering::SeqCst) && !process_exited {
            let event = match self.port.next_event(poll_interval) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Debug event wait failed: {}", e);
                    break;
                }
            };

            log_event(&event);
            process_exited = matches!(event.kind, DebugEventKind::ExitProcess { .. });

            let decision = self.machine.on_event(&event.kind);
            if decision.dump_and_terminate {
                self.handle_fatal(&event);
            }
            if let Err(e) = self.port.continue_event(&event, decision.continue_status) {
                tracing::warn!("Failed to continue debug event: {}", e);
            }
            if decision.confirm_attach {
                let _ = attached.send(true);
            }
        }

        tracing::debug!("Debug loop finished in state {:?}", self.machine.state());
    }

    fn handle_fatal(&mut self, event: &DebugEvent) {
        let path = self.faults.dumps.next_path();
        tracing::error!(
            "Exception occurred in thread {}, writing {:?}",
            event.thread_id,
            path
        );

        match self.port.write_fault_dump(event, &path) {
            Ok(()) => {
                let dump = GeneratedDump {
                    path,
                    reused: false,
                    created_at: SystemTime::now(),
                };
                let _ = self.faults.report.report(&dump, &self.faults.notify);
                *self.fatal_dump.lock() = Some(dump);
            }
            Err(e) => tracing::error!("Failed to write dump: {}", e),
        }

        if let Err(e) = self.port.terminate(event, FAULT_EXIT_CODE) {
            tracing::error!("Failed to terminate process {}: {}", event.process_id, e);
        }
    }
}

fn log_event(event: &DebugEvent) {
    match &event.kind {
        DebugEventKind::Exception {
            code,
            address,
            first_chance,
        } => tracing::debug!(
            "Exception {:#010x} at {:#x} in thread {} (first chance: {})",
            code,
            address,
            event.thread_id,
            first_chance
        ),
        DebugEventKind::CreateProcess { image_base } => {
            tracing::debug!("Create process {} at {:#x}", event.process_id, image_base)
        }
        DebugEventKind::ExitProcess { exit_code } => {
            tracing::debug!("Exit process {} rc={}", event.process_id, exit_code)
        }
        DebugEventKind::CreateThread { start_address } => {
            tracing::debug!("Create thread {} at {:#x}", event.thread_id, start_address)
        }
        DebugEventKind::ExitThread { exit_code } => {
            tracing::debug!("Exit thread {} rc={}", event.thread_id, exit_code)
        }
        DebugEventKind::LoadDll { base } => tracing::debug!("Load DLL at {:#x}", base),
        DebugEventKind::UnloadDll { base } => tracing::debug!("Unload DLL from {:#x}", base),
        DebugEventKind::OutputString { length } => {
            tracing::debug!("Debug string of {} bytes", length)
        }
        DebugEventKind::Rip { error } => tracing::debug!("RIP event, error {}", error),
        DebugEventKind::Other { code } => tracing::debug!("Unknown debug event {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exception(code: u32, first_chance: bool) -> DebugEventKind {
        DebugEventKind::Exception {
            code,
            address: 0x1000,
            first_chance,
        }
    }

    const ACCESS_VIOLATION: u32 = 0xC000_0005;

    fn live_machine() -> DebugStateMachine {
        let mut machine = DebugStateMachine::new();
        machine.on_event(&DebugEventKind::CreateProcess { image_base: 0x40_0000 });
        machine.on_event(&exception(EXCEPTION_BREAKPOINT_CODE, true));
        machine
    }

    #[test]
    fn test_attach_sequence_confirms_once() {
        let mut machine = DebugStateMachine::new();
        assert_eq!(machine.state(), DebuggerState::Attaching);

        let d = machine.on_event(&DebugEventKind::CreateProcess { image_base: 0 });
        assert!(!d.confirm_attach);
        assert_eq!(machine.state(), DebuggerState::AwaitingInitialBreakpoint);

        machine.on_event(&DebugEventKind::CreateThread { start_address: 0 });
        machine.on_event(&DebugEventKind::LoadDll { base: 0x7FF0_0000 });
        assert_eq!(machine.state(), DebuggerState::AwaitingInitialBreakpoint);

        let d = machine.on_event(&exception(EXCEPTION_BREAKPOINT_CODE, true));
        assert!(d.confirm_attach);
        assert!(!d.dump_and_terminate);
        assert_eq!(d.continue_status, ContinueStatus::Continue);
        assert_eq!(machine.state(), DebuggerState::Live);
        assert!(machine.attach_confirmed());
    }

    #[test]
    fn test_breakpoint_before_create_process_is_ignored() {
        let mut machine = DebugStateMachine::new();
        let d = machine.on_event(&exception(EXCEPTION_BREAKPOINT_CODE, true));
        assert_eq!(d, Decision::proceed());
        assert_eq!(machine.state(), DebuggerState::Attaching);
    }

    #[test]
    fn test_first_chance_exception_left_to_target() {
        let mut machine = live_machine();
        let d = machine.on_event(&exception(ACCESS_VIOLATION, true));
        assert_eq!(d.continue_status, ContinueStatus::NotHandled);
        assert!(!d.dump_and_terminate);
        assert_eq!(machine.state(), DebuggerState::Live);
    }

    #[test]
    fn test_second_chance_is_fatal() {
        let mut machine = live_machine();
        let d = machine.on_event(&exception(ACCESS_VIOLATION, false));
        assert!(d.dump_and_terminate);
        assert_eq!(d.continue_status, ContinueStatus::NotHandled);
        assert_eq!(machine.state(), DebuggerState::Stopping);

        // no second dump for the same death
        let d = machine.on_event(&exception(ACCESS_VIOLATION, false));
        assert!(!d.dump_and_terminate);
    }

    #[test]
    fn test_breakpoint_after_initial_is_fatal() {
        let mut machine = live_machine();
        let d = machine.on_event(&exception(EXCEPTION_BREAKPOINT_CODE, true));
        assert!(d.dump_and_terminate);
        assert!(!d.confirm_attach);
    }

    #[test]
    fn test_second_chance_during_attach_is_fatal() {
        let mut machine = DebugStateMachine::new();
        machine.on_event(&DebugEventKind::CreateProcess { image_base: 0 });
        let d = machine.on_event(&exception(ACCESS_VIOLATION, false));
        assert!(d.dump_and_terminate);
        assert!(!machine.attach_confirmed());
    }

    #[test]
    fn test_exit_process_stops() {
        let mut machine = live_machine();
        let d = machine.on_event(&DebugEventKind::ExitProcess { exit_code: 0 });
        assert_eq!(d, Decision::proceed());
        assert_eq!(machine.state(), DebuggerState::Stopping);
    }

    #[test]
    fn test_informational_events_continue() {
        let mut machine = live_machine();
        for kind in [
            DebugEventKind::CreateThread { start_address: 1 },
            DebugEventKind::ExitThread { exit_code: 0 },
            DebugEventKind::LoadDll { base: 2 },
            DebugEventKind::UnloadDll { base: 2 },
            DebugEventKind::OutputString { length: 12 },
            DebugEventKind::Rip { error: 5 },
        ] {
            assert_eq!(machine.on_event(&kind), Decision::proceed());
        }
        assert_eq!(machine.state(), DebuggerState::Live);
    }
}
