//! Unified error hierarchy for ZoneCoach
//!
//! Each concern owns a small error enum; `CoachError` ties them together for
//! the public entry points and maps every failure to a severity and a
//! user-facing message.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for all ZoneCoach operations
#[derive(Debug, Error)]
pub enum CoachError {
    /// Malformed sensor frame
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Transport and link lifecycle errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session and executor errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Checkpoint persistence errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Heart rate frame parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Frame carried no bytes at all
    #[error("Empty frame")]
    Empty,

    /// Frame ended before a declared field
    #[error("Truncated frame: {field} needs {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
}

/// Connection lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// A single connect attempt failed at the transport level
    #[error("Connection to {device_id} failed: {reason}")]
    ConnectionFailed { device_id: String, reason: String },

    /// Automatic reconnection gave up
    #[error("Reconnection failed after {attempts} attempts: {reason}")]
    ReconnectFailed { attempts: u8, reason: String },

    /// Connect attempt exceeded the configured timeout
    #[error("Connection to {device_id} timed out after {secs}s")]
    Timeout { device_id: String, secs: u64 },

    /// Operation requires a link that does not exist
    #[error("No device connected")]
    NotConnected,

    /// Generic transport adapter failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection manager task is gone
    #[error("Connection manager stopped")]
    ManagerStopped,
}

/// Session and executor errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Operation needs an active session
    #[error("No active session")]
    SessionNotFound,

    /// Training plan failed validation
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Calendar expression could not be parsed
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// Scheduled entry does not exist
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    /// The executor task is gone
    #[error("Session executor stopped")]
    ExecutorStopped,

    /// The session machine broke an invariant and the session was halted
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Checkpoint persistence errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Reading or writing the checkpoint file failed
    #[error("Checkpoint IO failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint content is not valid JSON for the expected shape
    #[error("Checkpoint at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Checkpoint names a state that cannot be restored
    #[error("Unknown checkpoint state: {0}")]
    UnknownState(String),

    /// Checkpoint progress does not fit its plan
    #[error("Checkpoint does not match its plan: {0}")]
    Inconsistent(String),
}

/// Result type alias for ZoneCoach operations
pub type Result<T> = std::result::Result<T, CoachError>;

impl CoachError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoachError::Connection(ConnectionError::ConnectionFailed { .. })
                | CoachError::Connection(ConnectionError::Timeout { .. })
                | CoachError::Connection(ConnectionError::ReconnectFailed { .. })
                | CoachError::Io(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CoachError::Parse(_) => ErrorSeverity::Info,
            CoachError::Connection(ConnectionError::ConnectionFailed { .. }) => {
                ErrorSeverity::Warning
            }
            CoachError::Connection(ConnectionError::Timeout { .. }) => ErrorSeverity::Warning,
            CoachError::Connection(_) => ErrorSeverity::Error,
            CoachError::Session(SessionError::SessionNotFound) => ErrorSeverity::Warning,
            CoachError::Session(SessionError::InvalidPlan(_)) => ErrorSeverity::Warning,
            CoachError::Session(SessionError::InvalidSchedule { .. }) => ErrorSeverity::Warning,
            CoachError::Checkpoint(_) => ErrorSeverity::Warning,
            CoachError::Session(SessionError::Internal(_)) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            CoachError::Connection(ConnectionError::ReconnectFailed { attempts, .. }) => {
                format!(
                    "Lost the heart rate sensor and could not reconnect after {} attempts. Tap retry to scan again.",
                    attempts
                )
            }
            CoachError::Connection(ConnectionError::Timeout { device_id, .. }) => {
                format!("Sensor {} did not answer. Make sure it is worn and awake.", device_id)
            }
            CoachError::Connection(ConnectionError::NotConnected) => {
                "No heart rate sensor is connected.".to_string()
            }
            CoachError::Session(SessionError::SessionNotFound) => {
                "There is no workout running.".to_string()
            }
            CoachError::Session(SessionError::InvalidPlan(reason)) => {
                format!("This training plan cannot be used: {}", reason)
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}
