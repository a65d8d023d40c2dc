use thiserror::Error;

/// A convenience `Result` alias using [`OkvmError`].
pub type OkvmResult<T> = Result<T, OkvmError>;

/// Top-level error type for the okvm runtime.
///
/// Variants map one-to-one onto the failure classes a turn or a request can
/// run into. Errors raised inside a tool or a single model exchange are
/// absorbed by the turn state machine and surfaced as structured content;
/// everything else propagates to the caller.
#[derive(Error, Debug)]
pub enum OkvmError {
    /// A path resolved outside of the workspace root.
    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    /// A write would push the workspace above its byte quota.
    #[error("Quota exceeded: write needs {requested} bytes but quota is {quota} bytes")]
    QuotaExceeded {
        /// Usage the workspace would reach if the write went through.
        requested: u64,
        /// Configured quota for the workspace.
        quota: u64,
    },

    /// A tool ran but could not complete its task.
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// A turn is already in flight for this session.
    #[error("Turn already in progress for client '{0}'")]
    TurnInProgress(String),

    /// The turn was cancelled or hit its hard timeout.
    #[error("Turn interrupted: {0}")]
    Interrupted(String),

    /// The host could not allocate a new workspace.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The conversation store is unavailable or rejected the write.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The client key supplied at the boundary is malformed.
    #[error("Invalid client key: {0}")]
    InvalidClientKey(String),

    /// No snapshot with the given identifier exists in the workspace log.
    #[error("Unknown snapshot: {0}")]
    UnknownSnapshot(String),

    /// The workspace was created without a snapshot backend.
    #[error("Workspace snapshots are disabled")]
    SnapshotsDisabled,

    /// Workspace state or version-control failure.
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// The model capability failed or returned something unusable.
    #[error("Model error: {0}")]
    Model(String),

    /// An external operation exceeded its deadline.
    #[error("Timed out after {0}")]
    Timeout(String),

    /// A requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OkvmError {
    /// Stable snake_case identifier used on the wire and in tool error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            OkvmError::SandboxViolation(_) => "sandbox_violation",
            OkvmError::QuotaExceeded { .. } => "quota_exceeded",
            OkvmError::ToolExecution(_) => "tool_execution_error",
            OkvmError::TurnInProgress(_) => "turn_in_progress",
            OkvmError::Interrupted(_) => "interrupted",
            OkvmError::ResourceExhausted(_) => "resource_exhausted",
            OkvmError::Persistence(_) => "persistence_error",
            OkvmError::InvalidClientKey(_) => "invalid_client_key",
            OkvmError::UnknownSnapshot(_) => "unknown_snapshot",
            OkvmError::SnapshotsDisabled => "snapshots_disabled",
            OkvmError::Workspace(_) => "workspace_error",
            OkvmError::Model(_) => "model_error",
            OkvmError::Timeout(_) => "timeout",
            OkvmError::NotFound(_) => "not_found",
            OkvmError::Config(_) => "config_error",
            OkvmError::Json(_) => "json_error",
            OkvmError::Io(_) => "io_error",
        }
    }

    /// Whether a turn can keep going after this error.
    ///
    /// Recoverable errors are reported back to the model as tool results;
    /// the rest end the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OkvmError::SandboxViolation(_)
                | OkvmError::QuotaExceeded { .. }
                | OkvmError::ToolExecution(_)
                | OkvmError::NotFound(_)
                | OkvmError::Timeout(_)
                | OkvmError::Json(_)
                | OkvmError::Io(_)
        )
    }
}
