//! Watchdog supervisor executable
//!
//! Usage:
//!   watchdog.exe /Executable <path> /ExecutableHash <digest>
//!                [/ExecutableArgs <args>] [/WorkingDirectory <dir>] [/Debug <any>]
//!                [--config <path>] [--verbose]
//!
//! Runs one supervision cycle and exits. The exit code depends on the
//! configured exit code policy.

use anyhow::{bail, Context};
use std::path::PathBuf;
use std::sync::Arc;

use watchdog_supervisor::core::config::WatchdogConfig;
use watchdog_supervisor::logging::{LogLevel, LoggingSystem};
use watchdog_supervisor::os::{native_backend, process_command_line};
use watchdog_supervisor::telemetry::{sink_from_config, NullTelemetry, TelemetrySink};
use watchdog_supervisor::watchdog::{LaunchSpec, Supervisor};

/// Command line arguments
#[derive(Debug, Default)]
struct Args {
    executable: Option<PathBuf>,
    executable_args: String,
    working_directory: Option<PathBuf>,
    executable_hash: String,
    debug: bool,
    config: Option<PathBuf>,
    verbose: bool,
    /// Tokens that matched no key, skipped one at a time
    ignored: Vec<String>,
}

impl Args {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut args = args.into_iter();
        let mut parsed = Args::default();

        while let Some(arg) = args.next() {
            let mut value = |key: &str| {
                args.next()
                    .with_context(|| format!("{} requires a value", key))
            };

            match arg.to_ascii_lowercase().as_str() {
                "/executable" => parsed.executable = Some(PathBuf::from(value(&arg)?)),
                "/executableargs" => parsed.executable_args = value(&arg)?,
                "/workingdirectory" => parsed.working_directory = Some(PathBuf::from(value(&arg)?)),
                "/executablehash" => parsed.executable_hash = value(&arg)?,
                "/debug" => {
                    value(&arg)?;
                    parsed.debug = true;
                }
                "--config" => parsed.config = Some(PathBuf::from(value(&arg)?)),
                "--verbose" | "-v" => parsed.verbose = true,
                "--help" | "-h" | "/?" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => parsed.ignored.push(arg),
            }
        }

        Ok(parsed)
    }
}

fn print_help() {
    println!(
        r#"Watchdog - Process Supervisor

USAGE:
    watchdog /Executable <PATH> /ExecutableHash <DIGEST> [OPTIONS]

OPTIONS:
    /Executable <PATH>          Application to launch (required)
    /ExecutableHash <DIGEST>    Expected SHA-1 of the application, uppercase hex
    /ExecutableArgs <ARGS>      Argument string passed to the application
    /WorkingDirectory <DIR>     Working directory of the application
    /Debug <ANY>                Attach as debugger instead of using the crash relay
    --config <PATH>             Configuration file (JSON)
    -v, --verbose               Enable debug logging
    -h, --help                  Print this help message
"#
    );
}

fn load_config(args: &Args) -> anyhow::Result<WatchdogConfig> {
    let mut config = match args.config {
        Some(ref path) => WatchdogConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => WatchdogConfig::load_or_default().context("Failed to load configuration")?,
    };

    if args.debug {
        config.attach_debugger = true;
    }
    if args.verbose {
        config.logging.level = LogLevel::Debug;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;
    let config = load_config(&args)?;

    let Some(executable) = args.executable.clone() else {
        print_help();
        bail!("/Executable is required");
    };

    let logging = LoggingSystem::init(config.logging.clone(), Some(&executable))
        .context("Failed to initialize logging")?;
    let log_guard = logging.install();

    tracing::info!("Starting watchdog for {:?}", executable);
    for arg in &args.ignored {
        tracing::warn!("Ignoring unrecognised argument: {}", arg);
    }
    if let Some(file) = logging.log_file() {
        tracing::debug!("Logging to {:?}", file);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let telemetry: Arc<dyn TelemetrySink> = match sink_from_config(&config.telemetry) {
        Ok(sink) => Arc::from(sink),
        Err(e) => {
            tracing::warn!("Telemetry unavailable: {}", e);
            Arc::new(NullTelemetry)
        }
    };

    let policy = config.exit_codes;
    let supervisor = Supervisor::new(native_backend(), config)
        .with_telemetry(telemetry)
        .with_dispatch(logging.dispatch())
        .with_command_line(process_command_line());

    let mut spec = LaunchSpec::new(executable, args.executable_hash).with_arguments(args.executable_args);
    if let Some(dir) = args.working_directory {
        spec = spec.with_working_dir(dir);
    }

    let outcome = runtime.block_on(supervisor.run(spec));
    let code = outcome.exit_code(policy);
    tracing::info!("Watchdog exiting: {} (rc={})", outcome.as_str(), code);

    drop(runtime);
    drop(log_guard);
    drop(logging);
    std::process::exit(code);
}
