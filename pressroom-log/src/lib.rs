//! Pressroom logging setup
//!
//! Installs a `tracing` subscriber configured from the environment. Library
//! crates only emit `tracing` events; binaries and tests call [`init`] once.
//!
//! # Usage
//!
//! ```rust
//! use pressroom_log::{Format, Level, LogConfig};
//!
//! let config = LogConfig::from_vars([
//!     ("PRESSROOM_LOG_LEVEL", "warn"),
//!     ("PRESSROOM_LOG_FORMAT", "compact"),
//! ])
//! .unwrap();
//!
//! assert_eq!(config.level, Level::Warn);
//! assert_eq!(config.format, Format::Compact);
//! ```
//!
//! # Environment Variables
//!
//! - `PRESSROOM_DEBUG=1` - Enable debug logging
//! - `PRESSROOM_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `PRESSROOM_LOG_FORMAT=json|pretty|compact` - Set output format
//! - `PRESSROOM_LOG_COLOR=1|0` - Enable/disable colors
//! - `PRESSROOM_LOG_MODULE=1|0` - Include the event target
//! - `RUST_LOG` - Full filter directives, overriding the level

use once_cell::sync::OnceCell;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt as layer_fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Most verbose
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// No logging
    Off,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
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
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "off" | "none" => Ok(Level::Off),
            other => Err(LogError::InvalidValue {
                name: "level",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line, human oriented
    Pretty,
    /// Single line
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for Format {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(Format::Pretty),
            "compact" => Ok(Format::Compact),
            "json" => Ok(Format::Json),
            other => Err(LogError::InvalidValue {
                name: "format",
                value: other.to_string(),
            }),
        }
    }
}

/// Logging errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// Environment variable holds an unusable value
    #[error("invalid log {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    /// Some other subscriber is already the global default
    #[error("global subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether colors are enabled
    pub color: bool,
    /// Whether to include the event target
    pub module_path: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            color: false,
            module_path: true,
        }
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl LogConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, LogError> {
        Self::from_vars(std::env::vars())
    }

    /// Read the configuration from `PRESSROOM_*` pairs. Unrelated pairs are
    /// ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, LogError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        let mut level = None;

        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "PRESSROOM_DEBUG" => config.debug = flag(value),
                "PRESSROOM_LOG_LEVEL" => level = Some(value.parse()?),
                "PRESSROOM_LOG_FORMAT" => config.format = value.parse()?,
                "PRESSROOM_LOG_COLOR" => config.color = flag(value),
                "PRESSROOM_LOG_MODULE" => config.module_path = flag(value),
                _ => {}
            }
        }

        config.level = level.unwrap_or(if config.debug {
            Level::Debug
        } else {
            Level::Info
        });
        Ok(config)
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Filter for the subscriber. `RUST_LOG` wins when set.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
    }
}

static INSTALLED: OnceCell<LogConfig> = OnceCell::new();

/// Install the global subscriber from the environment.
///
/// Calling it again after a successful install is a no-op.
pub fn init() -> Result<&'static LogConfig, LogError> {
    if let Some(config) = INSTALLED.get() {
        return Ok(config);
    }
    init_with(LogConfig::from_env()?)
}

/// Install the global subscriber with an explicit configuration.
///
/// Concurrent callers wait for the first install and all get its
/// configuration.
pub fn init_with(config: LogConfig) -> Result<&'static LogConfig, LogError> {
    INSTALLED.get_or_try_init(|| install(config))
}

fn install(config: LogConfig) -> Result<LogConfig, LogError> {
    let registry = tracing_subscriber::registry().with(config.filter());
    let result = match config.format {
        Format::Json => registry
            .with(
                layer_fmt::layer()
                    .json()
                    .with_target(config.module_path)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        Format::Pretty => registry
            .with(
                layer_fmt::layer()
                    .pretty()
                    .with_ansi(config.color)
                    .with_target(config.module_path)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        Format::Compact => registry
            .with(
                layer_fmt::layer()
                    .compact()
                    .with_ansi(config.color)
                    .with_target(config.module_path)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|e| LogError::AlreadyInstalled(e.to_string()))?;

    tracing::debug!(level = %config.level, format = ?config.format, "Logging initialized");
    Ok(config)
}

/// Configuration of the installed subscriber, if any.
pub fn config() -> Option<&'static LogConfig> {
    INSTALLED.get()
}
