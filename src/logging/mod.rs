//! Session-scoped logging for the watchdog
//!
//! One supervision session owns one `LoggingSystem`. The handle carries its own
//! `Dispatch` and the appender's `WorkerGuard`; it is installed as the default
//! dispatcher on the supervisor thread and handed to the debug worker
//! explicitly. Nothing is registered globally.

mod config;


pub use config::{LogFormat, LogLevel, LogOutput, LoggingConfig, LOG_FILE_SUFFIX};

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

/// Logging system errors
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to initialize logging: {0}")]
    InitializationError(String),

    #[error("Failed to create log directory: {0}")]
    DirectoryCreationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for logging operations
pub type LoggingResult<T> = Result<T, LoggingError>;

/// Scoped log handle for one supervision session
pub struct LoggingSystem {
    config: LoggingConfig,
    dispatch: Dispatch,
    log_file: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl LoggingSystem {
    /// Build the subscriber for `config`.
    ///
    /// `target` is the supervised executable; it determines the default log
    /// file location. The returned handle is not yet installed anywhere.
    pub fn init(config: LoggingConfig, target: Option<&Path>) -> LoggingResult<Self> {
        let env_filter = Self::build_env_filter(&config);

        let console_layer = config
            .output
            .writes_console()
            .then(|| Self::create_console_layer(&config));

        let (file_layer, guard, log_file) = if config.output.writes_file() {
            let path = config.log_file_path(target);
            let (layer, guard) = Self::create_file_layer(&config, &path)?;
            (Some(layer), Some(guard), Some(path))
        } else {
            (None, None, None)
        };

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer);

        let system = Self {
            config,
            dispatch: Dispatch::new(subscriber),
            log_file,
            _guard: guard,
        };

        if let Some(ref path) = system.log_file {
            tracing::dispatcher::with_default(&system.dispatch, || {
                tracing::info!("Opened log file {:?}", path);
            });
        }

        Ok(system)
    }

    /// Build environment filter from configuration
    fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
        let mut filter = EnvFilter::new(config.level.to_string());

        for (module, level) in &config.module_levels {
            match format!("{}={}", module, level).parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring log directive for {}: {}", module, e),
            }
        }

        filter
    }

    /// Create console logging layer
    fn create_console_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(config.include_target)
            .with_thread_ids(config.include_thread_id)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info);

        if config.format == LogFormat::Json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    }

    /// Create the append-only file layer
    fn create_file_layer<S>(
        config: &LoggingConfig,
        path: &Path,
    ) -> LoggingResult<(Box<dyn Layer<S> + Send + Sync>, WorkerGuard)>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| LoggingError::InitializationError(format!("No file name in {:?}", path)))?;

        std::fs::create_dir_all(&directory).map_err(|e| {
            LoggingError::DirectoryCreationError(format!(
                "Failed to create log directory {:?}: {}",
                directory, e
            ))
        })?;

        let file_appender = tracing_appender::rolling::never(&directory, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_target(config.include_target)
            .with_thread_ids(config.include_thread_id)
            .with_file(config.include_file_info)
            .with_line_number(config.include_file_info)
            .with_ansi(false);

        if config.format == LogFormat::Json {
            Ok((layer.json().boxed(), guard))
        } else {
            Ok((layer.boxed(), guard))
        }
    }

    /// Make this handle the default dispatcher for the calling thread until
    /// the returned guard is dropped
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::dispatcher::set_default(&self.dispatch)
    }

    /// Dispatcher to hand to worker threads
    pub fn dispatch(&self) -> Dispatch {
        self.dispatch.clone()
    }

    /// Path of the log file, when file output is enabled
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Get current log level
    pub fn log_level(&self) -> LogLevel {
        self.config.level
    }
}

impl Drop for LoggingSystem {
    fn drop(&mut self) {
        if self.log_file.is_some() {
            tracing::dispatcher::with_default(&self.dispatch, || {
                tracing::info!("Closed log file");
            });
        }
    }
}
