//! Structured logging setup.
//!
//! An interactive terminal gets console output only. Anything else (a GUI
//! launch, a service manager) also gets a daily rotating file under the data
//! directory, falling back to the console if that file cannot be opened.
//!
//! Filter priority: [`RuntimeConfig::log_filter`] (which `from_env` fills from
//! `WORKBENCH_LOG`) > `RUST_LOG` > the build-type default.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::config::{default_data_dir, RuntimeConfig};

/// Environment variable holding the crate's own log filter.
pub const LOG_ENV_VAR: &str = "WORKBENCH_LOG";

/// Prefix of rotated log files, e.g. `workbench.2026-10-19.log`.
const LOG_FILE_PREFIX: &str = "workbench";

type SetupError = Box<dyn std::error::Error + Send + Sync>;

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Console,
    ConsoleAndFile(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub sink: LogSink,
    /// Filter directives; `None` defers to `RUST_LOG` and the defaults.
    pub filter: Option<String>,
}

impl LogConfig {
    /// Console when stdout is a terminal, console plus files in `log_dir` otherwise.
    pub fn new(log_dir: PathBuf) -> Self {
        let sink = if atty::is(atty::Stream::Stdout) {
            LogSink::Console
        } else {
            LogSink::ConsoleAndFile(log_dir)
        };
        Self { sink, filter: None }
    }

    /// Logging for a runtime configuration, writing files under the data directory.
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self { filter: config.log_filter.clone(), ..Self::new(log_dir()) }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(default_log_filter());
        match self.filter.as_deref() {
            Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|e| {
                eprintln!("Warning: invalid log filter {directives:?} ({e}); using defaults");
                fallback()
            }),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Keeps the file writer alive. Dropping it flushes pending entries.
pub struct LoggingGuard {
    _file_writer: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// An embedding application that already installed one keeps it.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let file_writer = match &config.sink {
        LogSink::Console => None,
        LogSink::ConsoleAndFile(dir) => match init_console_and_file(&config, dir) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Warning: file logging unavailable ({e}); logging to console only");
                None
            }
        },
    };

    if file_writer.is_none() {
        init_console(&config);
    }
    LoggingGuard { _file_writer: file_writer }
}

/// Install logging from `WORKBENCH_*` environment settings.
pub fn init_logging_from_env() -> LoggingGuard {
    init_logging(LogConfig::from_runtime(&RuntimeConfig::from_env()))
}

fn init_console(config: &LogConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_target(false)
        .try_init();
}

fn init_console_and_file(config: &LogConfig, dir: &Path) -> Result<WorkerGuard, SetupError> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)?;
    let (file, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.with_max_level(tracing::Level::INFO).and(file))
        .with_env_filter(config.env_filter())
        .with_ansi(false)
        .with_thread_ids(true)
        .try_init()?;

    Ok(guard)
}

/// Default filter directives for the build type.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,workbench_core=trace,tokio_postgres=warn,mysql_async=warn,russh=warn"
    } else {
        "info,tokio_postgres=warn,mysql_async=warn,russh=warn"
    }
}

/// Directory holding rotated log files.
pub fn log_dir() -> PathBuf {
    default_data_dir().join("logs")
}
