//! Error types for the Storage Pool Manager
//!
//! Provides the error taxonomy shared by the command executor, the pool,
//! share, snapshot and quota managers, and the maintenance orchestrators.

use std::time::Duration;
use thiserror::Error;

/// Patterns in stderr that mark a failed command as transient (device busy class)
const TRANSIENT_PATTERNS: &[&str] = &[
    "Device or resource busy",
    "Resource busy",
    "EBUSY",
    "Text file busy",
];

/// Unified error type for the storage core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Command Execution Errors
    // =========================================================================
    #[error("Command {argv:?} exited with code {return_code}: {}", stderr.join(" | "))]
    CommandExecution {
        argv: Vec<String>,
        stdout: Vec<String>,
        stderr: Vec<String>,
        return_code: i32,
    },

    #[error("Command {argv:?} timed out after {timeout:?}")]
    CommandTimeout { argv: Vec<String>, timeout: Duration },

    // =========================================================================
    // Domain Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error(
        "Pool {pool} membership diverged from filesystem report (missing: {missing:?}, unexpected: {unexpected:?})"
    )]
    Inconsistent {
        pool: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after specific duration
    RetryAfter(Duration),
    /// Don't retry, surface to the caller
    NoRetry,
}

impl Error {
    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn parse(what: &str, reason: impl Into<String>) -> Self {
        Error::Parse {
            what: what.to_string(),
            reason: reason.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Device busy - retry with backoff
            e if e.is_transient() => ErrorAction::RetryWithBackoff,

            // Timed out status queries - retry later
            Error::CommandTimeout { .. } => ErrorAction::RetryAfter(Duration::from_secs(30)),

            // Another operation holds the pool - wait for it
            Error::StateConflict(_) => ErrorAction::RetryAfter(Duration::from_secs(60)),

            // Request and data errors - never retried automatically
            Error::Validation(_)
            | Error::NotFound { .. }
            | Error::Inconsistent { .. }
            | Error::Configuration(_)
            | Error::Parse { .. }
            | Error::CommandExecution { .. } => ErrorAction::NoRetry,

            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this is a device-busy class command failure
    pub fn is_transient(&self) -> bool {
        match self {
            Error::CommandExecution { stderr, .. } => stderr
                .iter()
                .any(|line| TRANSIENT_PATTERNS.iter().any(|p| line.contains(p))),
            _ => false,
        }
    }

    /// Last lines of stderr (or stdout when stderr is empty) of a failed command
    pub fn output_tail(&self, lines: usize) -> Option<String> {
        match self {
            Error::CommandExecution { stdout, stderr, .. } => {
                let source = if stderr.is_empty() { stdout } else { stderr };
                let start = source.len().saturating_sub(lines);
                Some(source[start..].join("\n"))
            }
            _ => None,
        }
    }
}

/// Result type alias for the storage core
pub type Result<T> = std::result::Result<T, Error>;
