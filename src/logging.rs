//! Structured logging for ZoneCoach
//!
//! Console output in pretty, JSON or compact form, plus an optional JSON log
//! file. The signal pipeline logs every rejected frame, so it gets its own
//! level that stays quiet unless asked for.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{
    fmt::{format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{CoachError, ErrorSeverity};

const DEFAULT_LOG_FILE: &str = "zonecoach.log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level for everything except the signal pipeline
    pub level: LogLevel,

    /// Level for `zonecoach::signal`; measurement-rate noise lives there
    pub signal_level: LogLevel,

    pub format: LogFormat,

    /// Also write JSON lines to this file
    pub file_path: Option<PathBuf>,

    /// Roll the log file over daily instead of appending forever
    pub rotation: bool,

    /// Emit span enter/close events for the session and connection tasks
    pub include_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            signal_level: LogLevel::Warn,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: true,
            include_spans: false,
        }
    }
}

impl LogConfig {
    /// Filter directives used when `RUST_LOG` is unset. A debug or trace
    /// global level also opens up the signal pipeline.
    pub fn directives(&self) -> String {
        let signal = if self.level >= LogLevel::Debug {
            self.level.max(self.signal_level)
        } else {
            self.signal_level
        };
        format!(
            "zonecoach={},zonecoach::signal={}",
            self.level.as_str(),
            signal.as_str()
        )
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()))
    }
}

/// Ordered from quietest to most verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Level selected by repeated `-v` flags, if any
    pub fn from_verbosity(count: u8) -> Option<Self> {
        match count {
            0 => None,
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Colored multi-line output for a terminal
    Pretty,
    Json,
    /// One line per event, used while following a live session
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

/// Writer for the log file: a daily rolling appender, or a single file
/// opened for append
fn file_writer(path: &Path, rotation: bool) -> std::io::Result<BoxMakeWriter> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    if rotation {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_LOG_FILE);
        Ok(BoxMakeWriter::new(tracing_appender::rolling::daily(dir, name)))
    } else {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BoxMakeWriter::new(Mutex::new(file)))
    }
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let spans = if config.include_spans {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let console = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_span_events(spans)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(config.include_spans)
            .with_span_list(config.include_spans)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_span_events(spans)
            .boxed(),
    };

    let file = match &config.file_path {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer(path, config.rotation)?)
                .with_current_span(config.include_spans)
                .with_span_list(config.include_spans),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(console)
        .with(file)
        .try_init()?;

    tracing::info!(
        level = %config.level,
        signal_level = %config.signal_level,
        format = ?config.format,
        file = ?config.file_path,
        "Logging initialized"
    );

    Ok(())
}

/// Log an error at the level matching its severity
pub fn log_error(context: &str, error: &CoachError) {
    let severity = error.severity();
    let retryable = error.is_retryable();
    match severity {
        ErrorSeverity::Critical | ErrorSeverity::Error => {
            tracing::error!(?severity, retryable, "{}: {}", context, error)
        }
        ErrorSeverity::Warning => tracing::warn!(?severity, retryable, "{}: {}", context, error),
        ErrorSeverity::Info => tracing::info!(retryable, "{}: {}", context, error),
    }
}
