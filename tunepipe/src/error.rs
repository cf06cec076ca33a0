//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an external tool could not be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchFailure {
    ExecutableNotFound,
    PermissionDenied,
    ArgumentRejected,
    Other(String),
}

impl std::fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExecutableNotFound => write!(f, "executable not found"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ArgumentRejected => write!(f, "argument rejected"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<process_utils::SpawnFailure> for LaunchFailure {
    fn from(failure: process_utils::SpawnFailure) -> Self {
        use process_utils::SpawnFailure;
        match failure {
            SpawnFailure::NotFound => Self::ExecutableNotFound,
            SpawnFailure::PermissionDenied => Self::PermissionDenied,
            SpawnFailure::InvalidArgument => Self::ArgumentRejected,
            SpawnFailure::Other(msg) => Self::Other(msg),
        }
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to launch {program}: {reason}")]
    Launch {
        program: String,
        reason: LaunchFailure,
    },

    #[error("Resolution failed: {0}")]
    Resolution(String),

    #[error("Process exited with code {exit_code:?}: {stderr_excerpt}")]
    Pipeline {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },

    #[error("{phase} timed out after {after_secs}s")]
    Timeout { phase: &'static str, after_secs: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn launch(program: impl Into<String>, reason: impl Into<LaunchFailure>) -> Self {
        Self::Launch {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Whether the next search candidate is worth trying after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Resolution(_) | Self::Pipeline { .. })
    }
}
