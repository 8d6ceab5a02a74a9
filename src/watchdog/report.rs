//! Report Dispatcher
//!
//! Hands a finished dump to the external crash-report tool. The tool is a
//! separate executable found next to the supervisor unless configured
//! otherwise; it is launched once and never waited on.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::SystemTime;

use super::dump::GeneratedDump;
use crate::core::error::ReportError;

/// File name of the report tool beside the supervisor executable
pub const REPORT_TOOL_NAME: &str = "CrashReporter.exe";

/// Message shown when the tool is missing
pub const REPORT_TOOL_MISSING_MESSAGE: &str =
    "An exception occurred, but the CrashReporter was not found";

/// Build width tag passed to the report tool
pub fn build_type() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        "Win64"
    } else {
        "Win32"
    }
}

/// Escape embedded double quotes as `\"`
pub fn escape_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '"' {
            out.push_str("\\\"");
        } else {
            out.push(c);
        }
    }
    out
}

/// Everything the report tool is told about one failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub dump_path: PathBuf,
    pub application_path: PathBuf,
    /// The supervisor's own command line, unescaped
    pub command_line: String,
    /// Dump time minus launch time, in whole seconds
    pub time_correction_secs: i64,
}

impl ReportRequest {
    pub fn new(
        dump_path: PathBuf,
        application_path: PathBuf,
        command_line: String,
        launched_at: SystemTime,
        dumped_at: SystemTime,
    ) -> Self {
        let time_correction_secs = match dumped_at.duration_since(launched_at) {
            Ok(elapsed) => elapsed.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        };

        Self {
            dump_path,
            application_path,
            command_line,
            time_correction_secs,
        }
    }

    /// Single argument string for the report tool
    pub fn arguments(&self) -> String {
        format!(
            "/DumpReport \"{}\" /ApplicationPath \"{}\" {} /TimeCorrection {} /buildType {}",
            self.dump_path.display(),
            self.application_path.display(),
            escape_quotes(&self.command_line),
            self.time_correction_secs,
            build_type()
        )
    }
}

/// Starts an external program with a pre-built argument string
pub trait ToolLauncher: Send + Sync {
    fn launch(&self, tool: &Path, arguments: &str) -> std::io::Result<()>;
}

/// Launches the tool as a detached child process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ToolLauncher for ProcessLauncher {
    #[cfg(windows)]
    fn launch(&self, tool: &Path, arguments: &str) -> std::io::Result<()> {
        use std::os::windows::process::CommandExt;

        let child = Command::new(tool).raw_arg(arguments).spawn()?;
        tracing::info!("Started crash reporter (pid {})", child.id());
        Ok(())
    }

    #[cfg(not(windows))]
    fn launch(&self, tool: &Path, arguments: &str) -> std::io::Result<()> {
        let child = Command::new(tool).args(split_arguments(arguments)).spawn()?;
        tracing::info!("Started crash reporter (pid {})", child.id());
        Ok(())
    }
}

/// Split a Windows-style argument string: whitespace separates, double quotes
/// group, `\"` is a literal quote.
pub fn split_arguments(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
                has_token = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if has_token {
        args.push(current);
    }
    args
}

/// Spawns the report tool for generated dumps
#[derive(Clone)]
pub struct ReportDispatcher {
    tool: PathBuf,
    launcher: Arc<dyn ToolLauncher>,
}

impl std::fmt::Debug for ReportDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportDispatcher")
            .field("tool", &self.tool)
            .finish()
    }
}

impl ReportDispatcher {
    pub fn new(tool: PathBuf) -> Self {
        Self::with_launcher(tool, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(tool: PathBuf, launcher: Arc<dyn ToolLauncher>) -> Self {
        Self { tool, launcher }
    }

    /// `CrashReporter.exe` in the supervisor's own directory
    pub fn default_tool_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(REPORT_TOOL_NAME)))
            .unwrap_or_else(|| PathBuf::from(REPORT_TOOL_NAME))
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Launch the tool once. A missing tool is reported, never retried.
    pub fn dispatch(&self, request: &ReportRequest) -> Result<(), ReportError> {
        if !self.tool.is_file() {
            tracing::error!("{} ({:?})", REPORT_TOOL_MISSING_MESSAGE, self.tool);
            return Err(ReportError::ToolNotFound {
                path: self.tool.clone(),
            });
        }

        let arguments = request.arguments();
        tracing::info!("Dispatching crash report: {} {}", self.tool.display(), arguments);
        self.launcher.launch(&self.tool, &arguments)?;
        Ok(())
    }
}

/// User-facing notification hook shared with the debugger thread
pub type Notify = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-session facts every report carries
#[derive(Clone)]
pub struct ReportContext {
    pub dispatcher: ReportDispatcher,
    pub application_path: PathBuf,
    pub command_line: String,
    pub launched_at: SystemTime,
}

impl ReportContext {
    pub fn request_for(&self, dump: &GeneratedDump) -> ReportRequest {
        ReportRequest::new(
            dump.path.clone(),
            self.application_path.clone(),
            self.command_line.clone(),
            self.launched_at,
            dump.created_at,
        )
    }

    /// Dispatch a report for `dump`; a missing tool is shown to the user
    pub fn report(&self, dump: &GeneratedDump, notify: &Notify) -> Result<(), ReportError> {
        let result = self.dispatcher.dispatch(&self.request_for(dump));
        match &result {
            Err(ReportError::ToolNotFound { .. }) => notify(REPORT_TOOL_MISSING_MESSAGE),
            Err(e) => tracing::error!("Failed to start crash reporter: {}", e),
            Ok(()) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct RecordingLauncher {
        calls: Mutex<Vec<(PathBuf, String)>>,
    }

    impl ToolLauncher for RecordingLauncher {
        fn launch(&self, tool: &Path, arguments: &str) -> std::io::Result<()> {
            self.calls.lock().push((tool.to_path_buf(), arguments.to_string()));
            Ok(())
        }
    }

    fn request(command_line: &str) -> ReportRequest {
        let launched = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        ReportRequest::new(
            PathBuf::from("C:\\Temp\\Game.dmp"),
            PathBuf::from("C:\\Games\\Client.exe"),
            command_line.to_string(),
            launched,
            launched + Duration::from_secs(95),
        )
    }

    #[test]
    fn test_escape_quotes() {
        assert_eq!(escape_quotes(r#"a "b" c"#), r#"a \"b\" c"#);
        assert_eq!(escape_quotes("plain"), "plain");
        assert_eq!(escape_quotes(""), "");
    }

    #[test]
    fn test_report_arguments_layout() {
        let args = request(r#"watchdog.exe /Executable "C:\Games\Client.exe""#).arguments();
        assert_eq!(
            args,
            format!(
                "/DumpReport \"C:\\Temp\\Game.dmp\" /ApplicationPath \"C:\\Games\\Client.exe\" \
                 watchdog.exe /Executable \\\"C:\\Games\\Client.exe\\\" /TimeCorrection 95 /buildType {}",
                build_type()
            )
        );
    }

    #[test]
    fn test_time_correction_before_launch_is_negative() {
        let launched = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let req = ReportRequest::new(
            PathBuf::from("d.dmp"),
            PathBuf::from("a.exe"),
            String::new(),
            launched,
            launched - Duration::from_secs(3),
        );
        assert_eq!(req.time_correction_secs, -3);
    }

    #[test]
    fn test_split_arguments_honours_escapes() {
        let args = split_arguments(r#"/DumpReport "C:\a b.dmp" x \"y\" /TimeCorrection 5"#);
        assert_eq!(
            args,
            vec!["/DumpReport", "C:\\a b.dmp", "x", "\"y\"", "/TimeCorrection", "5"]
        );
        assert_eq!(split_arguments(r#""" x"#), vec!["", "x"]);
        assert!(split_arguments("   ").is_empty());
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let launcher = Arc::new(RecordingLauncher::default());
        let dispatcher =
            ReportDispatcher::with_launcher(PathBuf::from("/no/such/CrashReporter.exe"), launcher.clone());

        let result = dispatcher.dispatch(&request("x"));
        assert!(matches!(result, Err(ReportError::ToolNotFound { .. })));
        assert!(launcher.calls.lock().is_empty());
    }

    #[test]
    fn test_dispatch_launches_once() {
        let tool = NamedTempFile::new().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let dispatcher = ReportDispatcher::with_launcher(tool.path().to_path_buf(), launcher.clone());

        dispatcher.dispatch(&request("game.exe")).unwrap();

        let calls = launcher.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, tool.path());
        assert!(calls[0].1.starts_with("/DumpReport "));
    }

    #[test]
    fn test_context_reports_missing_tool_to_user() {
        let shown = Arc::new(Mutex::new(Vec::<String>::new()));
        let notify: Notify = {
            let shown = shown.clone();
            Arc::new(move |m: &str| shown.lock().push(m.to_string()))
        };
        let launched = SystemTime::now();
        let context = ReportContext {
            dispatcher: ReportDispatcher::with_launcher(
                PathBuf::from("/no/such/CrashReporter.exe"),
                Arc::new(RecordingLauncher::default()),
            ),
            application_path: PathBuf::from("game.exe"),
            command_line: "watchdog".to_string(),
            launched_at: launched,
        };
        let dump = GeneratedDump {
            path: PathBuf::from("x.dmp"),
            reused: false,
            created_at: launched + Duration::from_secs(4),
        };

        assert_eq!(context.request_for(&dump).time_correction_secs, 4);
        assert!(context.report(&dump, &notify).is_err());
        assert_eq!(shown.lock().as_slice(), [REPORT_TOOL_MISSING_MESSAGE.to_string()]);
    }

    #[test]
    fn test_default_tool_beside_executable() {
        let path = ReportDispatcher::default_tool_path();
        assert_eq!(path.file_name().unwrap(), REPORT_TOOL_NAME);
    }
}
