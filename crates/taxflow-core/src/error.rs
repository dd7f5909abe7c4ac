use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaxflowError {
    // Definition errors
    #[error("Workflow definition invalid: {}", errors.join("; "))]
    DefinitionInvalid { errors: Vec<String> },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Workflow {workflow_id} has no enabled {kind} trigger")]
    NoTrigger { workflow_id: String, kind: String },

    // Action errors
    #[error("Action failed: {action}: {message}")]
    ActionFailed { action: String, message: String },

    #[error("Action timeout after {timeout_secs}s: {action}")]
    ActionTimeout { action: String, timeout_secs: u64 },

    #[error("No handler registered for action kind: {0}")]
    HandlerNotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    // Security errors
    #[error("Permission denied for stage {stage}: missing {missing:?}")]
    PermissionDenied { stage: String, missing: Vec<String> },

    // Execution control errors
    #[error("Execution is not running: {0}")]
    ExecutionNotRunning(String),

    #[error("Execution scheduler has shut down: {0}")]
    ExecutionClosed(String),

    // Notification errors
    #[error("Notification delivery failed: {channel}: {message}")]
    Notification { channel: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // TOML errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TaxflowError {
    /// Map a library error onto the execution-time error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DefinitionInvalid { .. }
            | Self::UnknownStage(_)
            | Self::UnknownWorkflow(_)
            | Self::NoTrigger { .. } => ErrorKind::DefinitionInvalid,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ActionTimeout { .. } => ErrorKind::ActionTimeout,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::Notification { .. } => ErrorKind::EscalationRequired,
            _ => ErrorKind::ActionFailed,
        }
    }

    /// Errors that abort a stage immediately, bypassing retry policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HandlerNotFound(_))
    }
}

/// Error taxonomy recorded against stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DefinitionInvalid,
    PermissionDenied,
    ActionTimeout,
    ActionFailed,
    ValidationFailed,
    EscalationRequired,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DefinitionInvalid => "definition_invalid",
            Self::PermissionDenied => "permission_denied",
            Self::ActionTimeout => "action_timeout",
            Self::ActionFailed => "action_failed",
            Self::ValidationFailed => "validation_failed",
            Self::EscalationRequired => "escalation_required",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, TaxflowError>;
