//! Error taxonomy shared by the controller, the execution backends and the worker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which external collaborator produced a non-zero status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendStage {
    Compute,
    Conversion,
}

impl fmt::Display for BackendStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStage::Compute => write!(f, "compute"),
            BackendStage::Conversion => write!(f, "conversion"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Invalid value for `{field}`: {reason}")]
    Configuration { field: &'static str, reason: String },

    #[error("Unknown preset: scenario {scenario}, variant {variant}")]
    UnknownPreset { scenario: u32, variant: u32 },

    #[error("Staged file not found: {path}")]
    NotFound { path: String },

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("{stage} backend returned status {status}")]
    Backend { stage: BackendStage, status: i32 },

    #[error("Input fetch failed: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        RunnerError::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// Tag carried by the `failed` event.
    pub fn kind(&self) -> FailureKind {
        match self {
            RunnerError::Configuration { .. } | RunnerError::UnknownPreset { .. } => {
                FailureKind::Configuration
            }
            RunnerError::NotFound { .. } => FailureKind::NotFound,
            RunnerError::Protocol(_) => FailureKind::Protocol,
            RunnerError::Backend { .. } => FailureKind::Backend,
            RunnerError::Transport(_) => FailureKind::Transport,
            RunnerError::Io(_) => FailureKind::Io,
        }
    }

    /// Status code reported by a failing collaborator, if any.
    pub fn status(&self) -> Option<i32> {
        match self {
            RunnerError::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    NotFound,
    Protocol,
    Backend,
    Transport,
    Io,
}

/// Serializable failure reason. Crosses the worker boundary and reaches UI layers,
/// so it carries the rendered message instead of the error value itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

impl Failure {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Protocol,
            message: message.into(),
            status: None,
        }
    }
}

impl From<&RunnerError> for Failure {
    fn from(err: &RunnerError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            status: err.status(),
        }
    }
}

impl From<RunnerError> for Failure {
    fn from(err: RunnerError) -> Self {
        Failure::from(&err)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
