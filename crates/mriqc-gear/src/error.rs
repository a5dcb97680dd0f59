//! Error taxonomy for the gear.

use std::path::PathBuf;

use crate::outcome::{EXIT_CONFIG_ERROR, EXIT_EXECUTION_FAILED, EXIT_PACKAGING_FAILED, EXIT_VALIDATION_FAILED};

/// Errors produced by the orchestration core.
///
/// Dataset-level validation issues and non-zero tool exits are *not* errors;
/// they travel as data (`ValidationOutcome`, `ExecutionResult`) to the
/// outcome report.
#[derive(Debug, thiserror::Error)]
pub enum GearError {
    #[error("invalid config option '{option}': {reason}")]
    Config { option: String, reason: String },

    #[error("conflicting config options: '{first}' and '{second}' cannot both be set")]
    ConfigConflict { first: String, second: String },

    #[error("validator '{program}' could not be run: {reason}")]
    ValidationTool { program: String, reason: String },

    #[error("failed to launch '{program}': {reason}")]
    Launch { program: String, reason: String },

    #[error("packaging failed for {path}: {reason}")]
    Packaging { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GearError {
    pub(crate) fn config(option: impl Into<String>, reason: impl Into<String>) -> Self {
        GearError::Config {
            option: option.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn packaging(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        GearError::Packaging {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Process exit code reserved for this class of fatal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            GearError::Config { .. } | GearError::ConfigConflict { .. } | GearError::Json(_) => {
                EXIT_CONFIG_ERROR
            }
            GearError::ValidationTool { .. } => EXIT_VALIDATION_FAILED,
            GearError::Launch { .. } => EXIT_EXECUTION_FAILED,
            GearError::Packaging { .. } | GearError::Io(_) => EXIT_PACKAGING_FAILED,
        }
    }
}

/// Result type for gear operations.
pub type Result<T> = std::result::Result<T, GearError>;
