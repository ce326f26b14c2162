//! Error types for the connector sanity harness.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The readiness gate exhausted its retries for a service.
    #[error("dependency '{service}' unavailable after {attempts} attempt(s): {last_error}")]
    DependencyUnavailable {
        service: String,
        attempts: u32,
        last_error: String,
    },

    /// The external test command is missing or not executable.
    #[error("cannot invoke '{command}': {reason}")]
    ScriptInvocation { command: String, reason: String },

    /// At least one test failed. Only raised once every lane has finished.
    #[error("{failed} test failure(s) across {lanes} lane(s)")]
    TestFailure { failed: usize, lanes: usize },

    /// The connector matrix could not be built.
    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error on a specific path.
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error aborts the run before any test executes.
    pub fn is_pre_test(&self) -> bool {
        matches!(
            self,
            Self::DependencyUnavailable { .. }
                | Self::ScriptInvocation { .. }
                | Self::InvalidMatrix(_)
                | Self::Config(_)
        )
    }
}

/// Convenience result alias.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;
