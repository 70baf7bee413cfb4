use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitPilotError {
    /// Rejected before a session exists; nothing was spawned.
    #[error("{0}")]
    Validation(String),

    #[error("failed to start '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("command failed: {command}\n{stderr}")]
    Command { command: String, stderr: String },

    #[error("permit for repository '{repository}' force-released after {held_secs}s")]
    LockTimeout { repository: String, held_secs: u64 },

    #[error("lock table for repository '{0}' is closed")]
    LockClosed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("agent exceeded its {0}s execution timeout")]
    Timeout(u64),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("unknown repository context: {0}")]
    UnknownRepository(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GitPilotError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GitPilotError::Validation(msg.into())
    }

    /// Whether this error represents a cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GitPilotError::Cancelled)
    }
}

impl From<claude_agent::ClaudeAgentError> for GitPilotError {
    fn from(err: claude_agent::ClaudeAgentError) -> Self {
        use claude_agent::ClaudeAgentError as E;
        match err {
            E::Spawn { executable, source } => GitPilotError::Spawn {
                program: executable,
                reason: source.to_string(),
            },
            E::Timeout { secs } => GitPilotError::Timeout(secs),
            E::Cancelled => GitPilotError::Cancelled,
            E::Process(msg) => GitPilotError::Command {
                command: "claude".into(),
                stderr: msg,
            },
            other => GitPilotError::Command {
                command: "claude".into(),
                stderr: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, GitPilotError>;
