//! Process Supervisor
//!
//! Runs one supervision cycle: verify the executable, launch it suspended,
//! publish the hidden launch arguments, resume, then block on the wait set
//! until the child exits, stalls its heartbeat or relays a fault.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::Instrument;

use super::backend::{Backend, ChildProcess, LaunchRequest, ObjectNames, Signal};
use super::crash_relay::{CrashRecord, CRASH_RECORD_SIZE};
use super::debugger::{AttachStatus, DebuggerSession, FaultHandling, FAULT_EXIT_CODE};
use super::dump::{DumpContext, DumpGenerator, GeneratedDump};
use super::launch_args::{build_command_line, generate_nonce, HiddenLaunchArgs, LAUNCH_ARGS_SEGMENT_SIZE};
use super::report::{Notify, ReportContext, ReportDispatcher};
use super::wait_set::{SignalRole, WaitSet};
use crate::core::config::{ExitCodePolicy, WatchdogConfig};
use crate::core::error::{DumpError, IntegrityError, LaunchError, ResourceError, WaitError, OS_ERROR_ALREADY_EXISTS};
use crate::core::utils::{epoch_seconds, generate_session_id, normalize_path};
use crate::integrity::verify_executable;
use crate::os::process_command_line;
use crate::telemetry::{NullTelemetry, TelemetryError, TelemetryEvent, TelemetrySink};

/// What the caller asked us to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    /// Argument string appended verbatim after the seed token
    pub arguments: String,
    pub working_dir: Option<PathBuf>,
    /// Expected uppercase hex digest of the executable
    pub expected_digest: String,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>, expected_digest: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            arguments: String::new(),
            working_dir: None,
            expected_digest: expected_digest.into(),
        }
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// How a supervision cycle ended
#[derive(Debug)]
pub enum ExitOutcome {
    /// The child exited on its own
    Exited { exit_code: Option<u32> },
    /// The heartbeat timer fired; the child was left running
    HeartbeatStalled { dump: Option<GeneratedDump> },
    /// A fault was relayed or observed by the debugger; the child was terminated
    Crashed { dump: Option<GeneratedDump> },
    /// The child could not be created
    LaunchFailed(LaunchError),
    /// The executable failed its digest check; nothing was started
    IntegrityMismatch { computed: String },
    /// The multiplexed wait itself failed
    WaitFailed(WaitError),
}

impl ExitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitOutcome::Exited { .. } => "exited",
            ExitOutcome::HeartbeatStalled { .. } => "heartbeat-stalled",
            ExitOutcome::Crashed { .. } => "crashed",
            ExitOutcome::LaunchFailed(_) => "launch-failed",
            ExitOutcome::IntegrityMismatch { .. } => "integrity-mismatch",
            ExitOutcome::WaitFailed(_) => "wait-failed",
        }
    }

    /// Dump produced during the cycle, if any
    pub fn dump(&self) -> Option<&GeneratedDump> {
        match self {
            ExitOutcome::HeartbeatStalled { dump } | ExitOutcome::Crashed { dump } => dump.as_ref(),
            _ => None,
        }
    }

    /// Supervisor exit code under `policy`
    pub fn exit_code(&self, policy: ExitCodePolicy) -> i32 {
        if policy == ExitCodePolicy::Compatible {
            return 0;
        }

        match self {
            ExitOutcome::Exited { .. } => 0,
            ExitOutcome::IntegrityMismatch { .. } => 2,
            ExitOutcome::LaunchFailed(_) => 3,
            ExitOutcome::HeartbeatStalled { .. } => 4,
            ExitOutcome::Crashed { .. } => 5,
            ExitOutcome::WaitFailed(_) => 6,
        }
    }
}

/// One supervised child and when it was started.
///
/// Dropping the session releases the process and thread handles.
pub struct ProcessSession<C: ChildProcess> {
    child: C,
    launched_at: SystemTime,
}

impl<C: ChildProcess> ProcessSession<C> {
    fn new(child: C) -> Self {
        Self {
            child,
            launched_at: SystemTime::now(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.pid()
    }

    pub fn main_thread_id(&self) -> u32 {
        self.child.main_thread_id()
    }

    pub fn launched_at(&self) -> SystemTime {
        self.launched_at
    }
}

/// User-facing text for a launch failure
pub fn launch_error_message(error: &LaunchError) -> String {
    match error {
        LaunchError::FileNotFound { path } => {
            format!("Failed to find file application file : {}", path.display())
        }
        LaunchError::PathNotFound { path } => {
            format!("Failed to find file application path : {}", path.display())
        }
        LaunchError::WorkingDirectoryNotFound { path } => {
            format!("Failed to find working directory : {}", path.display())
        }
        LaunchError::Os { code, .. } => format!("Unhandled error starting application : {}", code),
    }
}

/// User-facing text for a failed wait
pub fn wait_error_message(error: &WaitError) -> String {
    match error {
        WaitError::TimedOut => "Wait for application exit timed out.".to_string(),
        WaitError::Failed(code) => format!("Unhandled error waiting for application exit : {}", code),
        WaitError::UnknownIndex(_) => format!("Unhandled error waiting for application exit : {}", error),
    }
}

/// Drives supervision cycles on top of a [`Backend`]
pub struct Supervisor<B: Backend> {
    backend: Arc<B>,
    config: WatchdogConfig,
    names: ObjectNames,
    dumps: DumpGenerator,
    reporter: ReportDispatcher,
    telemetry: Arc<dyn TelemetrySink>,
    notify: Notify,
    dispatch: tracing::Dispatch,
    command_line: String,
}

impl<B: Backend> Clone for Supervisor<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
            names: self.names.clone(),
            dumps: self.dumps.clone(),
            reporter: self.reporter.clone(),
            telemetry: Arc::clone(&self.telemetry),
            notify: Arc::clone(&self.notify),
            dispatch: self.dispatch.clone(),
            command_line: self.command_line.clone(),
        }
    }
}

impl<B: Backend + 'static> Supervisor<B> {
    /// Create a supervisor that logs to the current default dispatcher
    pub fn new(backend: B, config: WatchdogConfig) -> Self {
        let backend = Arc::new(backend);
        let notify = notifier(Arc::clone(&backend), config.interactive);
        let tool = config
            .report_tool
            .clone()
            .unwrap_or_else(ReportDispatcher::default_tool_path);

        Self {
            names: ObjectNames::new(config.object_prefix.clone()),
            dumps: DumpGenerator::new(config.dump_directory(), config.dump_file_prefix.clone()),
            reporter: ReportDispatcher::new(tool),
            telemetry: Arc::new(NullTelemetry),
            notify,
            dispatch: tracing::dispatcher::get_default(|d| d.clone()),
            command_line: process_command_line(),
            backend,
            config,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn with_reporter(mut self, reporter: ReportDispatcher) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// The supervisor's own command line as forwarded to the report tool
    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = command_line.into();
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one supervision cycle.
    ///
    /// The digest check and telemetry run on the async runtime; the blocking
    /// launch and wait run on a blocking thread.
    pub async fn run(&self, spec: LaunchSpec) -> ExitOutcome {
        let session_id = generate_session_id();
        let span = tracing::info_span!("session", id = %session_id);

        async move {
            if let Some(outcome) = self.check_integrity(&spec).await {
                return outcome;
            }

            let this = self.clone();
            let span = tracing::Span::current();
            let handle = tokio::task::spawn_blocking(move || {
                tracing::dispatcher::with_default(&this.dispatch, || {
                    span.in_scope(|| this.supervise(&spec))
                })
            });

            match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    tracing::error!("Supervision task was cancelled: {}", e);
                    ExitOutcome::WaitFailed(WaitError::Failed(0))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Synchronous cycle for callers without a runtime. Integrity mismatch
    /// telemetry is not sent on this path.
    pub fn run_blocking(&self, spec: &LaunchSpec) -> ExitOutcome {
        let session_id = generate_session_id();
        let span = tracing::info_span!("session", id = %session_id);
        let _entered = span.enter();

        if let Err(outcome) = self.gate(spec, verify_executable(&spec.executable, &spec.expected_digest)) {
            return outcome;
        }
        self.supervise(spec)
    }

    async fn check_integrity(&self, spec: &LaunchSpec) -> Option<ExitOutcome> {
        let executable = spec.executable.clone();
        let expected = spec.expected_digest.clone();
        let dispatch = self.dispatch.clone();
        let verdict = tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&dispatch, || verify_executable(&executable, &expected))
        })
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Digest task failed: {}", e);
            Err(IntegrityError::Mismatch {
                expected: spec.expected_digest.clone(),
                actual: String::new(),
            })
        });

        let outcome = self.gate(spec, verdict).err()?;
        if let ExitOutcome::IntegrityMismatch { ref computed } = outcome {
            let event = TelemetryEvent::hash_mismatch(
                epoch_seconds(SystemTime::now()),
                computed.clone(),
                spec.executable.clone(),
            );
            match self.telemetry.send(&event).await {
                Ok(()) => tracing::info!("Reported checksum mismatch"),
                Err(TelemetryError::Disabled) => tracing::debug!("Telemetry disabled"),
                Err(e) => tracing::warn!("Failed to report checksum mismatch: {}", e),
            }
        }
        Some(outcome)
    }

    /// Decide whether a digest verdict lets the launch proceed
    fn gate(&self, spec: &LaunchSpec, verdict: Result<String, IntegrityError>) -> Result<(), ExitOutcome> {
        match verdict {
            Ok(digest) => {
                tracing::info!("Checksum verified for {:?}: {}", spec.executable, digest);
                Ok(())
            }
            Err(IntegrityError::Mismatch { expected, actual }) => {
                if !self.config.enforce_integrity {
                    tracing::warn!(
                        "Checksum mismatch ignored: supplied {}, computed {}",
                        expected,
                        actual
                    );
                    return Ok(());
                }
                tracing::error!(
                    "Checksum mismatch: supplied {}, computed {}. Launch aborted.",
                    expected,
                    actual
                );
                Err(ExitOutcome::IntegrityMismatch { computed: actual })
            }
        }
    }

    /// Launch and wait. Blocks the calling thread until the cycle ends.
    fn supervise(&self, spec: &LaunchSpec) -> ExitOutcome {
        let supervisor_pid = self.backend.supervisor_pid();

        let heartbeat = match self
            .backend
            .create_heartbeat_timer(&self.names.heartbeat_timer(supervisor_pid))
        {
            Ok(timer) => Some(timer),
            Err(e) => {
                tracing::warn!("{}. Heartbeat monitoring disabled.", e);
                None
            }
        };

        let port = if self.config.attach_debugger {
            match self.backend.debug_port() {
                Ok(port) => Some(port),
                Err(e) => {
                    tracing::warn!("{}. Falling back to crash relay.", e);
                    None
                }
            }
        } else {
            None
        };

        // the debugger replaces the crash relay
        let crash_relay = if port.is_none() {
            self.create_crash_relay(supervisor_pid)
        } else {
            None
        };

        let executable = normalize_path(&spec.executable);
        let nonce = generate_nonce();
        let command_line = build_command_line(&executable, nonce, &spec.arguments);
        let request = LaunchRequest {
            executable: &executable,
            command_line: &command_line,
            working_dir: spec.working_dir.as_deref(),
        };

        let mut session = match self.backend.spawn_suspended(&request) {
            Ok(child) => ProcessSession::new(child),
            Err(e) => {
                tracing::error!("Launch failed ({})", e.tag());
                (self.notify)(&launch_error_message(&e));
                return ExitOutcome::LaunchFailed(e);
            }
        };
        tracing::info!(
            "Started process {} (thread {}): {}",
            session.pid(),
            session.main_thread_id(),
            command_line
        );

        let _launch_args = self.publish_launch_args(supervisor_pid, session.pid(), nonce);

        let report = ReportContext {
            dispatcher: self.reporter.clone(),
            application_path: executable.clone(),
            command_line: self.command_line.clone(),
            launched_at: session.launched_at(),
        };

        let debugger = port.and_then(|port| self.start_debugger(port, &session, report.clone()));

        if let Err(e) = session.child.resume() {
            tracing::error!("Failed to resume process {}: {}", session.pid(), e);
            if let Err(e) = session.child.terminate(FAULT_EXIT_CODE) {
                tracing::warn!("Failed to terminate suspended process: {}", e);
            }
            let error = LaunchError::Os {
                code: e.raw_os_error().unwrap_or_default() as u32,
                message: e.to_string(),
            };
            (self.notify)(&launch_error_message(&error));
            return ExitOutcome::LaunchFailed(error);
        }

        let wait_set = WaitSet::new(
            session.child.waitable(),
            heartbeat.as_ref().map(|timer| timer.waitable()),
            crash_relay.as_ref().map(|(event, _)| event.waitable()),
        );
        tracing::debug!("Waiting on {:?}", wait_set.roles());

        let role = self
            .backend
            .wait_any(&wait_set.handles())
            .and_then(|index| wait_set.resolve(index));

        let outcome = match role {
            Ok(SignalRole::ProcessExit) => self.on_process_exit(&mut session, debugger.as_ref()),
            Ok(SignalRole::Heartbeat) => self.on_heartbeat(&session, &report),
            Ok(SignalRole::CrashSignal) => {
                let segment = crash_relay.as_ref().map(|(_, segment)| segment);
                self.on_crash_signal(&mut session, segment, &report)
            }
            Err(e) => {
                (self.notify)(&wait_error_message(&e));
                ExitOutcome::WaitFailed(e)
            }
        };

        drop(debugger);
        tracing::info!("Supervision finished: {}", outcome.as_str());
        outcome
    }

    /// Crash event plus record segment, or `None` when either cannot be made
    fn create_crash_relay(&self, supervisor_pid: u32) -> Option<(B::Signal, B::Segment)> {
        let event = match self
            .backend
            .create_crash_event(&self.names.crash_event(supervisor_pid))
        {
            Ok(event) => event,
            Err(ResourceError::CrashEventExists(name)) => {
                tracing::warn!("Crash event {} already exists", name);
                (self.notify)(&format!(
                    "Call to CreateEvent failed : {}\nCrash monitoring disabled.",
                    OS_ERROR_ALREADY_EXISTS
                ));
                return None;
            }
            Err(e) => {
                tracing::warn!("{}. Crash monitoring disabled.", e);
                return None;
            }
        };

        match self.backend.create_segment(
            &self.names.crash_segment(supervisor_pid),
            CRASH_RECORD_SIZE,
            true,
        ) {
            Ok(segment) => Some((event, segment)),
            Err(e) => {
                tracing::warn!("{}. Crash monitoring disabled.", e);
                None
            }
        }
    }

    fn publish_launch_args(&self, supervisor_pid: u32, child_pid: u32, nonce: u32) -> Option<B::Segment> {
        let segment = match self.backend.create_segment(
            &self.names.launch_args(child_pid),
            LAUNCH_ARGS_SEGMENT_SIZE,
            false,
        ) {
            Ok(segment) => segment,
            Err(e) => {
                tracing::warn!("Launch args not published: {}", e);
                return None;
            }
        };

        match HiddenLaunchArgs::new(supervisor_pid, child_pid, nonce).write_to(&segment) {
            Ok(()) => Some(segment),
            Err(e) => {
                tracing::warn!("Launch args not published: {}", e);
                None
            }
        }
    }

    fn start_debugger(
        &self,
        port: B::Port,
        session: &ProcessSession<B::Child>,
        report: ReportContext,
    ) -> Option<DebuggerSession> {
        let faults = FaultHandling {
            dumps: self.dumps.clone(),
            report,
            notify: Arc::clone(&self.notify),
        };

        let debugger = match DebuggerSession::start(
            port,
            session.pid(),
            self.config.debug_poll_interval(),
            faults,
            self.dispatch.clone(),
        ) {
            Ok(debugger) => debugger,
            Err(e) => {
                tracing::error!("{}", e);
                return None;
            }
        };

        let timeout: Duration = self.config.debugger_attach_timeout();
        match debugger.wait_for_attach(timeout) {
            AttachStatus::Attached => tracing::info!("Debugger ready"),
            AttachStatus::Failed => tracing::warn!("Debugger failed to attach, continuing unmonitored"),
            AttachStatus::TimedOut => {
                tracing::warn!("Debugger did not attach within {:?}, continuing", timeout)
            }
        }
        Some(debugger)
    }

    fn on_process_exit(
        &self,
        session: &mut ProcessSession<B::Child>,
        debugger: Option<&DebuggerSession>,
    ) -> ExitOutcome {
        let exit_code = match session.child.exit_code() {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!("Failed to read exit code: {}", e);
                None
            }
        };
        tracing::info!("Process {} exited rc={:?}", session.pid(), exit_code);

        if let Some(dump) = debugger.and_then(|d| d.fatal_dump()) {
            return ExitOutcome::Crashed { dump: Some(dump) };
        }
        ExitOutcome::Exited { exit_code }
    }

    /// Environment-only dump; the child keeps running
    fn on_heartbeat(&self, session: &ProcessSession<B::Child>, report: &ReportContext) -> ExitOutcome {
        tracing::warn!("Heartbeat timer fired, process {} is not responding", session.pid());

        let context = DumpContext::EnvironmentOnly {
            thread_id: session.main_thread_id(),
        };
        let dump = self.dump_and_report(
            self.dumps.generate(self.backend.as_ref(), &session.child, context),
            report,
        );
        ExitOutcome::HeartbeatStalled { dump }
    }

    /// Read the relayed record, dump, then terminate the parked child
    fn on_crash_signal(
        &self,
        session: &mut ProcessSession<B::Child>,
        segment: Option<&B::Segment>,
        report: &ReportContext,
    ) -> ExitOutcome {
        tracing::warn!("Process {} signalled a crash", session.pid());

        let record = match segment.map(|s| CrashRecord::read_from(s)) {
            Some(Ok(record)) => Some(record),
            Some(Err(e)) => {
                tracing::error!("Failed to read crash record: {}", e);
                None
            }
            None => None,
        };

        let dump = record.and_then(|record| {
            self.dump_and_report(
                self.dumps
                    .generate_from_record(self.backend.as_ref(), &session.child, &record),
                report,
            )
        });

        if let Err(e) = session.child.terminate(FAULT_EXIT_CODE) {
            tracing::error!("Failed to terminate process {}: {}", session.pid(), e);
        }
        ExitOutcome::Crashed { dump }
    }

    fn dump_and_report(
        &self,
        dump: Result<GeneratedDump, DumpError>,
        report: &ReportContext,
    ) -> Option<GeneratedDump> {
        match dump {
            Ok(dump) => {
                let _ = report.report(&dump, &self.notify);
                Some(dump)
            }
            Err(e) => {
                tracing::error!("Failed to write dump: {}", e);
                None
            }
        }
    }
}

/// Log every notification; show it to the user as well when interactive
fn notifier<B: Backend + 'static>(backend: Arc<B>, interactive: bool) -> Notify {
    Arc::new(move |message: &str| {
        tracing::error!("{}", message);
        if interactive {
            backend.notify_user(message);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_messages() {
        let exe = PathBuf::from("C:\\Games\\Client.exe");
        assert_eq!(
            launch_error_message(&LaunchError::FileNotFound { path: exe.clone() }),
            "Failed to find file application file : C:\\Games\\Client.exe"
        );
        assert_eq!(
            launch_error_message(&LaunchError::PathNotFound { path: exe }),
            "Failed to find file application path : C:\\Games\\Client.exe"
        );
        assert_eq!(
            launch_error_message(&LaunchError::WorkingDirectoryNotFound {
                path: PathBuf::from("D:\\nowhere")
            }),
            "Failed to find working directory : D:\\nowhere"
        );
        assert_eq!(
            launch_error_message(&LaunchError::Os {
                code: 5,
                message: "Access is denied.".to_string()
            }),
            "Unhandled error starting application : 5"
        );
    }

    #[test]
    fn test_wait_messages() {
        assert_eq!(
            wait_error_message(&WaitError::TimedOut),
            "Wait for application exit timed out."
        );
        assert_eq!(
            wait_error_message(&WaitError::Failed(6)),
            "Unhandled error waiting for application exit : 6"
        );
    }

    #[test]
    fn test_exit_code_policies() {
        let outcomes = [
            (ExitOutcome::Exited { exit_code: Some(3) }, 0),
            (ExitOutcome::IntegrityMismatch { computed: String::new() }, 2),
            (
                ExitOutcome::LaunchFailed(LaunchError::FileNotFound { path: PathBuf::new() }),
                3,
            ),
            (ExitOutcome::HeartbeatStalled { dump: None }, 4),
            (ExitOutcome::Crashed { dump: None }, 5),
            (ExitOutcome::WaitFailed(WaitError::Failed(6)), 6),
        ];

        for (outcome, distinct) in outcomes {
            assert_eq!(outcome.exit_code(ExitCodePolicy::Compatible), 0);
            assert_eq!(outcome.exit_code(ExitCodePolicy::Distinct), distinct, "{}", outcome.as_str());
        }
    }

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("game.exe", "abc")
            .with_arguments("-windowed")
            .with_working_dir("C:\\Games");
        assert_eq!(spec.arguments, "-windowed");
        assert_eq!(spec.working_dir, Some(PathBuf::from("C:\\Games")));
        assert_eq!(spec.expected_digest, "abc");
    }
}
