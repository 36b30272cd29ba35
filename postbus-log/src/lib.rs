//! Postbus Logging
//!
//! Builds the structured logger handed to the bus at construction time.
//!
//! The bus never reaches for a process-wide logger. A [`Logger`] owns a
//! [`tracing::Dispatch`] and every future the bus spawns runs under it, so
//! two buses in the same process can log to different sinks.
//!
//! # Usage
//!
//! ```rust
//! use postbus_log::{Format, Level, LogConfig, Logger};
//!
//! let logger = Logger::new(&LogConfig {
//!     level: Level::Debug,
//!     format: Format::Compact,
//!     ..Default::default()
//! });
//!
//! logger.in_scope(|| tracing::info!(queue = "orders_queue", "consumer started"));
//! ```
//!
//! # Environment Variables
//!
//! - `POSTBUS_DEBUG=1` - Enable debug logging
//! - `POSTBUS_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `POSTBUS_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `POSTBUS_LOG_COLOR=1|0` - Enable/disable colors
//! - `POSTBUS_LOG_TARGET=1|0` - Include the module path of each event
//! - `POSTBUS_LOG_FILTER=<directives>` - Full `EnvFilter` directives, overrides the level

use std::env;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use thiserror::Error;
use tracing::Dispatch;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

// ============================================================================
// Log Levels
// ============================================================================

/// Log level for the bus logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Trace level (most verbose)
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level (least verbose)
    Error = 4,
    /// Off (no logging)
    Off = 5,
}

impl Level {
    /// Get level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }

    /// The `EnvFilter` directive equivalent to this level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

impl FromStr for Level {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "off" | "none" => Ok(Level::Off),
            other => Err(LogError::InvalidLevel(other.to_string())),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line human readable output
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    Json,
}

impl FromStr for Format {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Format::Pretty),
            "compact" => Ok(Format::Compact),
            "json" => Ok(Format::Json),
            other => Err(LogError::InvalidFormat(other.to_string())),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while configuring a logger.
#[derive(Debug, Error)]
pub enum LogError {
    /// Unknown level name
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Unknown format name
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Filter directives could not be parsed
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    /// A process-wide default was already installed
    #[error("Failed to install logger: {0}")]
    Install(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether ANSI colors are enabled
    pub color: bool,
    /// Whether to include the event target (module path)
    pub target: bool,
    /// Raw `EnvFilter` directives; takes precedence over `level`
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Json,
            color: false, // JSON output doesn't use colors
            target: true,
            filter: None,
        }
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup.
    ///
    /// Unknown or malformed values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let debug = lookup("POSTBUS_DEBUG").map(|v| flag(&v)).unwrap_or(false);

        let level = lookup("POSTBUS_LOG_LEVEL")
            .and_then(|s| s.parse().ok())
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = lookup("POSTBUS_LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Format::Json);

        let color = lookup("POSTBUS_LOG_COLOR")
            .map(|v| flag(&v))
            .unwrap_or_else(|| lookup("NO_COLOR").is_none() && lookup("TERM").is_some());

        let target = lookup("POSTBUS_LOG_TARGET")
            .map(|v| flag(&v))
            .unwrap_or(true);

        let filter = lookup("POSTBUS_LOG_FILTER").filter(|f| !f.trim().is_empty());

        Self {
            level,
            format,
            color: color && format != Format::Json,
            target,
            filter,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        match &self.filter {
            Some(directives) => EnvFilter::try_new(directives)
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_directive())),
            None => EnvFilter::new(self.level.as_directive()),
        }
    }

    /// Check that the filter directives parse.
    pub fn validate(&self) -> Result<(), LogError> {
        if let Some(directives) = &self.filter {
            EnvFilter::try_new(directives)
                .map_err(|e| LogError::InvalidFilter(e.to_string()))?;
        }
        Ok(())
    }
}

// ============================================================================
// Logger
// ============================================================================

/// An explicitly constructed, structured, leveled logger.
///
/// Cloning is cheap; clones share the same subscriber.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    level: Level,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("level", &self.level).finish()
    }
}

impl Logger {
    /// Build a logger writing to stderr.
    pub fn new(config: &LogConfig) -> Self {
        Self::with_writer(config, std::io::stderr)
    }

    /// Build a logger writing to the given writer.
    pub fn with_writer<W>(config: &LogConfig, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(config.env_filter())
            .with_ansi(config.color)
            .with_target(config.target)
            .with_writer(writer);

        let dispatch = match config.format {
            #[cfg(feature = "json")]
            Format::Json => Dispatch::new(builder.json().finish()),
            #[cfg(not(feature = "json"))]
            Format::Json => Dispatch::new(builder.compact().finish()),
            Format::Compact => Dispatch::new(builder.compact().finish()),
            Format::Pretty => Dispatch::new(builder.pretty().finish()),
        };

        Self {
            dispatch,
            level: config.level,
        }
    }

    /// Default construction helper: configuration from the environment.
    ///
    /// Returns a fresh logger on every call; nothing is cached globally.
    pub fn from_env() -> Self {
        Self::new(&LogConfig::from_env())
    }

    /// Reuse whatever subscriber is the default for the calling thread.
    pub fn current() -> Self {
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        Self {
            dispatch,
            level: Level::Trace,
        }
    }

    /// A logger that discards every event.
    pub fn none() -> Self {
        Self {
            dispatch: Dispatch::none(),
            level: Level::Off,
        }
    }

    /// The configured minimum level.
    pub fn level(&self) -> Level {
        self.level
    }

    /// The underlying dispatcher.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Run a closure with this logger as the thread's default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Attach this logger to a future; every poll runs under it.
    pub fn instrument<F: Future>(&self, future: F) -> WithDispatch<F> {
        future.with_subscriber(self.dispatch.clone())
    }

    /// Make this logger the process-wide default.
    ///
    /// Optional: the bus itself never relies on the global default.
    pub fn install(&self) -> Result<(), LogError> {
        tracing::dispatcher::set_global_default(self.dispatch.clone())
            .map_err(|e| LogError::Install(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Off);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("debug".parse::<Level>().unwrap(), Level::Debug);
        assert_eq!("DEBUG".parse::<Level>().unwrap(), Level::Debug);
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warn);
        assert!("invalid".parse::<Level>().is_err());
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("pretty".parse::<Format>().unwrap(), Format::Pretty);
        assert_eq!("Compact".parse::<Format>().unwrap(), Format::Compact);
        assert_eq!("json".parse::<Format>().unwrap(), Format::Json);
        assert!("xml".parse::<Format>().is_err());
    }

    #[test]
    fn test_config_from_lookup_defaults() {
        let config = LogConfig::from_lookup(lookup(&[]));
        assert_eq!(config.level, Level::Info);
        assert_eq!(config.format, Format::Json);
        assert!(!config.color);
        assert!(config.filter.is_none());
    }

    #[test]
    fn test_debug_flag_lowers_level() {
        let config = LogConfig::from_lookup(lookup(&[("POSTBUS_DEBUG", "true")]));
        assert_eq!(config.level, Level::Debug);

        let config = LogConfig::from_lookup(lookup(&[
            ("POSTBUS_DEBUG", "1"),
            ("POSTBUS_LOG_LEVEL", "error"),
        ]));
        assert_eq!(config.level, Level::Error);
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        let config = LogConfig {
            filter: Some("postbus=notalevel".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_logger_respects_level() {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let logger = Logger::with_writer(&LogConfig::default(), move || writer.clone());

        logger.in_scope(|| {
            tracing::debug!("hidden event");
            tracing::info!(queue = "orders_queue", "consumer started");
        });

        let output = buffer.contents();
        assert!(output.contains("consumer started"));
        assert!(output.contains("orders_queue"));
        assert!(output.contains("INFO"));
        assert!(!output.contains("hidden event"));
    }

    #[test]
    fn test_loggers_are_independent() {
        let first = Buffer::default();
        let second = Buffer::default();
        let (w1, w2) = (first.clone(), second.clone());
        let a = Logger::with_writer(&LogConfig::default(), move || w1.clone());
        let b = Logger::with_writer(&LogConfig::default(), move || w2.clone());

        a.in_scope(|| tracing::info!("to first"));
        b.in_scope(|| tracing::info!("to second"));

        assert!(first.contents().contains("to first"));
        assert!(!first.contents().contains("to second"));
        assert!(second.contents().contains("to second"));
    }

    #[tokio::test]
    async fn test_instrumented_future_uses_logger() {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let logger = Logger::with_writer(&LogConfig::default(), move || writer.clone());

        logger
            .instrument(async {
                tokio::task::yield_now().await;
                tracing::warn!(attempt = 2, "handler retrying");
            })
            .await;

        assert!(buffer.contents().contains("handler retrying"));
    }

    #[test]
    fn test_none_logger_is_off() {
        assert_eq!(Logger::none().level(), Level::Off);
    }
}
