use thiserror::Error;

/// Error code recorded by the reaper for runs whose holder vanished.
pub const LOCK_EXPIRED_CODE: &str = "LOCK_EXPIRED";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    #[error("tool `{tool}` timed out after {timeout_ms} ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("tool category `{category}` is unavailable (circuit open)")]
    ToolUnavailable { category: String },

    #[error("model provider error [{kind}]: {message}")]
    ModelProvider { kind: String, message: String },

    #[error("iteration cap of {max_iterations} exceeded")]
    CapExceeded { max_iterations: u32 },

    #[error("lock lost for run {run_id}")]
    LockLost { run_id: String },

    #[error("run setup failed: {0}")]
    Setup(String),
}

impl RunError {
    pub fn code(&self) -> &'static str {
        match self {
            RunError::TransientInfra(_) => "TRANSIENT_INFRA",
            RunError::ToolTimeout { .. } => "TOOL_TIMEOUT",
            RunError::ToolUnavailable { .. } => "TOOL_UNAVAILABLE",
            RunError::ModelProvider { .. } => "MODEL_PROVIDER",
            RunError::CapExceeded { .. } => "CAP_EXCEEDED",
            RunError::LockLost { .. } => "LOCK_LOST",
            RunError::Setup(_) => "SETUP_FAILED",
        }
    }

    /// Whether a later attempt of the same operation may succeed. Cap,
    /// lock and setup failures are final for the run that produced them.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunError::TransientInfra(_)
            | RunError::ToolTimeout { .. }
            | RunError::ToolUnavailable { .. } => true,
            RunError::ModelProvider { kind, .. } => kind != "AUTHENTICATION",
            RunError::CapExceeded { .. } | RunError::LockLost { .. } | RunError::Setup(_) => false,
        }
    }

    pub fn infra(err: impl std::fmt::Display) -> Self {
        RunError::TransientInfra(err.to_string())
    }
}
