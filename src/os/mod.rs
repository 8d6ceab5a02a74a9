//! OS integration layer
//!
//! [`windows`] drives the real Win32 primitives. [`portable`] emulates them
//! with files so the supervisor runs on development hosts too. The aliases
//! below pick the native flavour for the supervisor and for the target side.

#[cfg(windows)]
pub mod windows;

pub mod portable;

#[cfg(windows)]
pub type NativeBackend = windows::WindowsBackend;
#[cfg(not(windows))]
pub type NativeBackend = portable::PortableBackend;

/// Crash event handle as seen by the supervised application
#[cfg(windows)]
pub type TargetEvent = windows::NamedEvent;
#[cfg(not(windows))]
pub type TargetEvent = portable::FileEvent;

/// Heartbeat timer handle as seen by the supervised application
#[cfg(windows)]
pub type TargetTimer = windows::WaitableTimer;
#[cfg(not(windows))]
pub type TargetTimer = portable::FileTimer;

/// Backend for the current platform
pub fn native_backend() -> NativeBackend {
    NativeBackend::new()
}

/// Id of the calling thread, as recorded in crash records
pub fn current_thread_id() -> u32 {
    #[cfg(windows)]
    {
        windows::current_thread_id()
    }
    #[cfg(not(windows))]
    {
        portable::current_thread_id()
    }
}

/// This process's command line as the OS recorded it.
///
/// Windows hands back the raw string with the caller's quoting intact.
/// Elsewhere the arguments are rejoined with Windows-style quoting.
pub fn process_command_line() -> String {
    #[cfg(windows)]
    {
        if let Some(line) = windows::raw_command_line() {
            return line;
        }
    }
    join_command_line(std::env::args())
}

/// Join arguments into one command line, quoting any argument that is empty
/// or contains whitespace or a double quote. Embedded quotes become `\"`.
pub fn join_command_line<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for arg in args {
        let arg = arg.as_ref();
        if !line.is_empty() {
            line.push(' ');
        }
        if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"') {
            line.push_str(arg);
            continue;
        }
        line.push('"');
        for c in arg.chars() {
            if c == '"' {
                line.push('\\');
            }
            line.push(c);
        }
        line.push('"');
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_keeps_plain_arguments_bare() {
        assert_eq!(join_command_line(["watchdog", "/Debug", "1"]), "watchdog /Debug 1");
    }

    #[test]
    fn test_join_quotes_spaces_and_quotes() {
        let line = join_command_line([
            "watchdog.exe",
            "/Executable",
            r"C:\Program Files\Game\x.exe",
            "/ExecutableArgs",
            r#"-name "Big Map""#,
            "",
        ]);
        assert_eq!(
            line,
            r#"watchdog.exe /Executable "C:\Program Files\Game\x.exe" /ExecutableArgs "-name \"Big Map\"" """#
        );
    }

    #[test]
    fn test_process_command_line_is_not_empty() {
        assert!(!process_command_line().is_empty());
    }
}
