//! The vessel failure taxonomy.
//!
//! Every layer (builders, cache, pool, bridge, session, front) reports
//! failures through [`VesselError`]. The type is `Clone` so that one build
//! failure can be handed to every caller that was waiting on it.

use thiserror::Error;

use crate::log::LogEntry;

/// Stable prefix of every build failure message.
pub const BUILD_FAILURE_MESSAGE: &str = "A problem occurred while creating the environment";

/// Result type for vessel operations.
pub type VesselResult<T> = Result<T, VesselError>;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Clone, Error)]
pub enum VesselError {
    /// Malformed or unsupported configuration for a builder kind.
    #[error("{message}")]
    Config { key: String, message: String },

    /// The requested kind has no registered builder.
    #[error("Unknown environment kind: '{0}'")]
    UnknownEnvironmentKind(String),

    /// Builder-level failure, with every BUILD log collected so far.
    #[error("A problem occurred while creating the environment: {reason}")]
    Build { reason: String, logs: Vec<LogEntry> },

    /// The worker crashed, failed to start, or closed without a result.
    #[error("bridge failure: {0}")]
    BridgeFailure(String),

    /// A frame exceeded the configured message size limit. Never retried.
    #[error("transport limit exceeded: {0}")]
    TransportLimitExceeded(String),

    /// Internal bug class, always fatal to the session.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Unknown task id (or other missing entity).
    #[error("not found: {0}")]
    NotFound(String),

    /// The session was cancelled before it finished.
    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),
}

impl VesselError {
    /// Configuration error about a specific key.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        VesselError::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// The builder received a keyword it does not accept.
    pub fn unexpected_key(key: &str) -> Self {
        VesselError::config(key, format!("unexpected keyword argument '{}'", key))
    }

    /// Build failure carrying the logs gathered up to this point.
    pub fn build(reason: impl Into<String>, logs: Vec<LogEntry>) -> Self {
        VesselError::Build {
            reason: reason.into(),
            logs,
        }
    }

    /// Stable, machine-readable name of the error kind (used on the wire).
    pub fn kind_name(&self) -> &'static str {
        match self {
            VesselError::Config { .. } => "config_error",
            VesselError::UnknownEnvironmentKind(_) => "unknown_environment_kind",
            VesselError::Build { .. } => "build_error",
            VesselError::BridgeFailure(_) => "bridge_failure",
            VesselError::TransportLimitExceeded(_) => "transport_limit_exceeded",
            VesselError::InvariantViolation(_) => "invariant_violation",
            VesselError::NotFound(_) => "not_found",
            VesselError::Cancelled => "cancelled",
            VesselError::Io(_) => "io_error",
        }
    }

    /// Logs attached to a build failure, empty for every other kind.
    pub fn build_logs(&self) -> &[LogEntry] {
        match self {
            VesselError::Build { logs, .. } => logs,
            _ => &[],
        }
    }
}

impl From<std::io::Error> for VesselError {
    fn from(err: std::io::Error) -> Self {
        VesselError::Io(err.to_string())
    }
}
