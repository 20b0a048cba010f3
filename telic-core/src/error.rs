//! Error taxonomy for the value loop scheduler
//!
//! Covers agent transient, verification failure, service health failure,
//! external blocker, git failure, state corruption, and process crash.
//! Handlers classify and recover from the first four; only
//! `CrashSupervisor` catches the rest.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout `telic-core`.
pub type LoopResult<T> = Result<T, LoopError>;

/// Errors that can occur while running the value loop.
#[derive(Error, Debug)]
pub enum LoopError {
    /// The agent session timed out or returned a truncated tool-call.
    #[error("agent transient failure in role {role}: {message}")]
    AgentTransient { role: String, message: String },

    /// A verification script could not be executed at all (missing file,
    /// not executable, etc) — distinct from a verification that ran and
    /// exited non-zero, which is a normal `Verification::status = failed`.
    #[error("verification runner failure for {script}: {message}")]
    VerificationRunner { script: PathBuf, message: String },

    /// Git operation failed.
    #[error("git operation failed: {operation} — {message}")]
    Git { operation: String, message: String },

    /// The advisory lock for this sprint is held by another process.
    #[error("sprint '{sprint}' is locked by pid {owner_pid}")]
    LockHeld { sprint: String, owner_pid: u32 },

    /// Attempted to write a file git refuses to stage (credentials, keys).
    #[error("refusing to stage sensitive file: {path}")]
    SensitiveFile { path: PathBuf },

    /// `state.json` failed to deserialize and no checkpoint could recover it.
    #[error("state store corrupted at {path}: {message}")]
    StateCorrupted { path: PathBuf, message: String },

    /// A state mutation would violate one of `LoopState`'s invariants.
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    /// Budget, iteration, or attempt ceiling reached.
    #[error("budget exhausted: {message}")]
    BudgetExhausted { message: String },

    /// Config value missing or malformed.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Dependency cycle detected in the task graph.
    #[error("dependency cycle detected among tasks: {task_ids:?}")]
    DependencyCycle { task_ids: Vec<String> },

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoopError {
    pub fn agent_transient(role: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AgentTransient {
            role: role.into(),
            message: message.into(),
        }
    }

    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation without escalating is reasonable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AgentTransient { .. } => true,
            Self::Git { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("connection")
                    || lower.contains("another git process")
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// A short machine-readable code for the delivery report's blocker list.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AgentTransient { .. } => "AGENT_TRANSIENT",
            Self::VerificationRunner { .. } => "VERIFICATION_RUNNER",
            Self::Git { .. } => "GIT_FAILURE",
            Self::LockHeld { .. } => "LOCK_HELD",
            Self::SensitiveFile { .. } => "SENSITIVE_FILE",
            Self::StateCorrupted { .. } => "STATE_CORRUPTED",
            Self::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            Self::BudgetExhausted { .. } => "BUDGET_EXHAUSTED",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::DependencyCycle { .. } => "DEPENDENCY_CYCLE",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

/// One entry in the delivery report's error/blocker provenance list.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorProvenance {
    pub iteration: u32,
    pub action: String,
    pub code: String,
    pub message: String,
}

impl ErrorProvenance {
    pub fn new(iteration: u32, action: impl Into<String>, err: &LoopError) -> Self {
        Self {
            iteration,
            action: action.into(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
