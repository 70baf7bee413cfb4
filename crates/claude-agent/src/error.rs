use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClaudeAgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse stream-json line: {source}\n  line: {line}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Process error: {0}")]
    Process(String),

    #[error("agent exceeded its {secs}s execution timeout")]
    Timeout { secs: u64 },

    #[error("agent run cancelled")]
    Cancelled,
}

impl ClaudeAgentError {
    /// True when the process never started (missing binary, bad cwd, ...).
    pub fn is_spawn(&self) -> bool {
        matches!(self, ClaudeAgentError::Spawn { .. })
    }
}
