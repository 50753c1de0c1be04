//! # Logging Utilities
//!
//! Logging setup for sidestep binaries and tests, built on `tracing`.
//!
//! The core crate only emits `tracing` events; whoever embeds it decides where
//! they go. This module provides the usual choices:
//! - Console output in a pretty or JSON format
//! - An additional (or exclusive) log file written by a background worker
//! - A quiet, idempotent subscriber for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sidestep_utils::init_logging;
//!
//! // Reads RUST_LOG, SIDESTEP_LOG_FORMAT and SIDESTEP_LOG_FILE.
//! let _guard = init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("debugger started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Filter directives (e.g., `RUST_LOG=debug`, `RUST_LOG=sidestep_core::engine=trace`)
//! - `SIDESTEP_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `SIDESTEP_LOG_FILE`: Optional log file, written in addition to the console
//!
//! Keep the returned [`LoggingGuard`] alive for as long as logging is needed;
//! dropping it flushes the file writer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const FORMAT_VAR: &str = "SIDESTEP_LOG_FORMAT";
/// Environment variable naming an additional log file.
pub const FILE_VAR: &str = "SIDESTEP_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level; the stepping engine logs every dispatched event here
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Keeps the background file writer alive
///
/// Dropping the guard flushes pending lines. Console-only setups hold nothing.
#[derive(Debug, Default)]
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard
{
    _worker: Option<WorkerGuard>,
}

/// Initialize logging from the environment
///
/// - `RUST_LOG`: filter directives, `info` when unset
/// - `SIDESTEP_LOG_FORMAT`: `json` or `pretty`
/// - `SIDESTEP_LOG_FILE`: also write to this file
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed, if
/// `SIDESTEP_LOG_FORMAT` holds an unknown format, or if the log file's
/// directory cannot be created.
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var(FORMAT_VAR) {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::Pretty,
    };
    let file = env::var_os(FILE_VAR).map(PathBuf::from);
    install(format, &env_directives(Level::INFO), file.as_deref(), true)
}

/// Initialize console logging with an explicit level and format
///
/// `RUST_LOG` is ignored; `SIDESTEP_LOG_FILE` is still honored.
///
/// ## Example
///
/// ```rust,no_run
/// use sidestep_utils::{LogFormat, LogLevel, init_logging_with_level};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Pretty)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Same as [`init_logging`].
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    let file = env::var_os(FILE_VAR).map(PathBuf::from);
    install(format, &Level::from(level).to_string(), file.as_deref(), true)
}

/// Log only to a file, never to the console
///
/// Useful when the debugger owns the terminal. Without `path` the file is
/// `<dir>/YYYY-MM-DD-sidestep.log`, where `<dir>` is `~/.sidestep` or the
/// system temporary directory. Returns the file actually used.
///
/// ## Errors
///
/// Same as [`init_logging`].
pub fn init_logging_to_file(
    path: Option<PathBuf>,
    level: Option<LogLevel>,
    format: LogFormat,
) -> Result<(PathBuf, LoggingGuard), LoggingError>
{
    let path = match path {
        Some(path) => path,
        None => default_log_file()?,
    };
    let directives = match level {
        Some(level) => Level::from(level).to_string(),
        None => env_directives(Level::INFO),
    };
    let guard = install(format, &directives, Some(&path), false)?;
    Ok((path, guard))
}

/// Route `tracing` output through the test harness
///
/// Safe to call from every test; only the first call installs a subscriber.
/// Honors `RUST_LOG` and defaults to `warn` so passing tests stay quiet.
pub fn init_test_logging()
{
    let layer = fmt::layer()
        .with_test_writer()
        .with_target(true)
        .with_thread_names(true)
        .with_filter(EnvFilter::new(env_directives(Level::WARN)));
    // Another test already installed it.
    let _ = Registry::default().with(layer).try_init();
}

/// `RUST_LOG`, or `default` when unset.
fn env_directives(default: Level) -> String
{
    env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| default.to_string())
}

fn default_log_file() -> Result<PathBuf, LoggingError>
{
    let today = Utc::now().format("%Y-%m-%d");
    let directory = match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".sidestep"),
        None => env::temp_dir(),
    };
    std::fs::create_dir_all(&directory)?;
    Ok(directory.join(format!("{today}-sidestep.log")))
}

fn install(format: LogFormat, directives: &str, file: Option<&Path>, console: bool) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut worker = None;

    if console {
        layers.push(format_layer(format, io::stdout, true).with_filter(EnvFilter::new(directives)).boxed());
    }
    if let Some(path) = file {
        let directory = path.parent().filter(|parent| !parent.as_os_str().is_empty());
        let directory = directory.unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| LoggingError::InvalidFile(path.display().to_string()))?;
        let appender = tracing_appender::rolling::never(directory, file_name);
        let (writer, file_worker) = tracing_appender::non_blocking(appender);
        worker = Some(file_worker);
        layers.push(format_layer(format, writer, false).with_filter(EnvFilter::new(directives)).boxed());
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))?;
    Ok(LoggingGuard { _worker: worker })
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'writer> fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());
    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    /// The log file path has no file name
    #[error("Invalid log file: {0}")]
    InvalidFile(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
