//! Error types for the unipack core.
//!
//! The taxonomy mirrors how failures are handled: adapter queries swallow
//! every variant into an empty result, while operations carry them into their
//! terminal state.

use std::sync::Arc;

use thiserror::Error;

/// The main error type for unipack operations.
#[derive(Debug, Error)]
pub enum UnipackError {
    /// The executable is missing or the OS refused to run it.
    #[error("Failed to launch '{program}': {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exceeded its time budget and was killed.
    #[error("Command timed out after {seconds}s: {command}")]
    TimedOut { command: String, seconds: u64 },

    /// Tool output could not be interpreted.
    #[error("Could not parse output of {manager}: {reason}")]
    ParseFailure { manager: String, reason: String },

    /// A recognized failure that an automatic remediation may fix.
    #[error("Transient failure: {0}")]
    TransientFailure(String),

    /// A failure no remediation applies to.
    #[error("Command failed: {0}")]
    PermanentFailure(String),

    /// The caller cancelled the work.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration-related errors (file parsing, validation, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// File I/O operation failures
    #[error("I/O operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// Decision store persistence failures
    #[error("Store '{store}' failed: {reason}")]
    Store { store: String, reason: String },

    /// The manager does not offer this capability.
    #[error("{manager} does not support {capability}")]
    Unsupported {
        manager: String,
        capability: &'static str,
    },

    /// No manager with this name is registered.
    #[error("Unknown package manager: {0}")]
    UnknownManager(String),

    /// The operation was refused by a decision rule.
    #[error("Operation blocked: {0}")]
    Blocked(String),

    /// Concurrent access or task errors
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// An error shared between several callers of one deduplicated call.
    #[error(transparent)]
    Shared(Arc<UnipackError>),
}

/// A type alias for Results that use UnipackError.
pub type Result<T> = std::result::Result<T, UnipackError>;

impl UnipackError {
    /// Creates a new ParseFailure error with context.
    pub fn parse<S1, S2>(manager: S1, reason: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        UnipackError::ParseFailure {
            manager: manager.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new Store error with context.
    pub fn store<S1, S2>(store: S1, reason: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        UnipackError::Store {
            store: store.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new PermanentFailure error with context.
    pub fn command_failed<S1, S2>(cmd: S1, details: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        UnipackError::PermanentFailure(format!("{}: {}", cmd.into(), details.into()))
    }

    /// Returns true if this error represents a transient failure that might be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            UnipackError::TransientFailure(_) => true,
            UnipackError::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the work was cancelled rather than failing.
    pub fn is_cancelled(&self) -> bool {
        match self {
            UnipackError::Cancelled(_) => true,
            UnipackError::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    /// Returns the error category as a string for logging.
    pub fn category(&self) -> &'static str {
        match self {
            UnipackError::LaunchFailure { .. } => "launch_failure",
            UnipackError::TimedOut { .. } => "timed_out",
            UnipackError::ParseFailure { .. } => "parse_failure",
            UnipackError::TransientFailure(_) => "transient_failure",
            UnipackError::PermanentFailure(_) => "permanent_failure",
            UnipackError::Cancelled(_) => "cancelled",
            UnipackError::Config(_) => "config",
            UnipackError::Io(_) => "io",
            UnipackError::Store { .. } => "store",
            UnipackError::Unsupported { .. } => "unsupported",
            UnipackError::UnknownManager(_) => "unknown_manager",
            UnipackError::Blocked(_) => "blocked",
            UnipackError::Concurrency(_) => "concurrency",
            UnipackError::Shared(inner) => inner.category(),
        }
    }
}

impl From<Arc<UnipackError>> for UnipackError {
    fn from(err: Arc<UnipackError>) -> Self {
        UnipackError::Shared(err)
    }
}

impl From<config::ConfigError> for UnipackError {
    fn from(err: config::ConfigError) -> Self {
        UnipackError::Config(anyhow::Error::from(err))
    }
}

impl From<validator::ValidationErrors> for UnipackError {
    fn from(err: validator::ValidationErrors) -> Self {
        UnipackError::Config(anyhow::Error::from(err))
    }
}

impl From<serde_json::Error> for UnipackError {
    fn from(err: serde_json::Error) -> Self {
        UnipackError::store("json", err.to_string())
    }
}

impl From<tokio::task::JoinError> for UnipackError {
    fn from(err: tokio::task::JoinError) -> Self {
        UnipackError::Concurrency(format!("Task join error: {}", err))
    }
}
