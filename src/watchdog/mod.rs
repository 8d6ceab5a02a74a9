//! Watchdog Module
//!
//! Process supervision and crash diagnosis. The supervisor launches the
//! target suspended, hands it hidden launch arguments through shared memory,
//! and then waits for one of three things: the process exits, the heartbeat
//! timer fires, or the target relays a fault. Abnormal ends produce a dump
//! and a report.
//!
//! [`target`] is the other side of the link, used by the supervised
//! application itself.

pub mod backend;
pub mod crash_relay;
pub mod debugger;
pub mod dump;
pub mod launch_args;
pub mod report;
pub mod shared_memory;
pub mod supervisor;
pub mod target;
pub mod wait_set;


pub use backend::{Backend, ChildProcess, LaunchRequest, ObjectNames, Signal, DEFAULT_OBJECT_PREFIX};
pub use crash_relay::{CrashRecord, CRASH_RECORD_SIZE};
pub use debugger::{DebugEvent, DebugEventKind, DebugPort, DebugStateMachine, DebuggerSession, DebuggerState};
pub use dump::{DumpContext, DumpGenerator, GeneratedDump};
pub use launch_args::HiddenLaunchArgs;
pub use report::{ReportDispatcher, ReportRequest, REPORT_TOOL_NAME};
pub use shared_memory::{SharedMemory, SharedMemoryError};
pub use supervisor::{ExitOutcome, LaunchSpec, Supervisor};
pub use target::{TargetError, WatchdogLink};
pub use wait_set::{SignalRole, WaitSet};
