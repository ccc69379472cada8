//! Source-tagged log entries.

use serde::{Deserialize, Serialize};

/// Where a log line originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Environment builder output (pip, conda, ...).
    Build,
    /// Worker control plane (agent diagnostics, bridge lifecycle).
    Bridge,
    /// The user program itself.
    User,
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogSource::Build => write!(f, "build"),
            LogSource::Bridge => write!(f, "bridge"),
            LogSource::User => write!(f, "user"),
        }
    }
}

/// Which stream a log line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Stdout,
    Stderr,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Stdout => write!(f, "stdout"),
            LogLevel::Stderr => write!(f, "stderr"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

/// One line of output, attributed to its source and stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(source: LogSource, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            source,
            level,
            message: message.into(),
        }
    }

    pub fn build_stdout(message: impl Into<String>) -> Self {
        Self::new(LogSource::Build, LogLevel::Stdout, message)
    }

    pub fn build_stderr(message: impl Into<String>) -> Self {
        Self::new(LogSource::Build, LogLevel::Stderr, message)
    }

    pub fn build_trace(message: impl Into<String>) -> Self {
        Self::new(LogSource::Build, LogLevel::Trace, message)
    }

    pub fn bridge(level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(LogSource::Bridge, level, message)
    }

    pub fn user(level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(LogSource::User, level, message)
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.source, self.level, self.message)
    }
}
