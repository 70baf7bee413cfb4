use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GitPilotError, Result};

pub type SessionId = String;

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Commit,
    Push,
    CreatePr,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Commit => "commit",
            OperationKind::Push => "push",
            OperationKind::CreatePr => "create-pr",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OperationRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub set_upstream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    /// A caller-composed commit message. When present the commit is made
    /// directly without the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub repository_context_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub options: OperationOptions,
    #[serde(default)]
    pub execute_now: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, repository_context_id: impl Into<String>) -> Self {
        Self {
            kind,
            repository_context_id: repository_context_id.into(),
            custom_instructions: None,
            options: OperationOptions::default(),
            execute_now: false,
            created_at: Utc::now(),
        }
    }

    /// Reject requests that must never become sessions.
    pub fn validate(&self) -> Result<()> {
        if self.repository_context_id.trim().is_empty() {
            return Err(GitPilotError::validation("repositoryContextId is required"));
        }
        if self.kind == OperationKind::Commit {
            if let Some(message) = &self.options.message {
                if message.trim().is_empty() {
                    return Err(GitPilotError::validation("Commit message cannot be empty"));
                }
            }
        }
        self.options.validate()
    }
}

impl OperationOptions {
    /// Reject remote and branch names git would read as something else:
    /// an option (`--receive-pack=..`), a refspec (`:main`), or a range.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("remote", &self.remote),
            ("branch", &self.branch),
            ("baseBranch", &self.base_branch),
        ] {
            if let Some(v) = value {
                if !is_plain_ref_name(v) {
                    return Err(GitPilotError::validation(format!(
                        "Invalid {field}: '{v}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_plain_ref_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.contains("..")
        && !name.contains("@{")
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || ":~^?*[\\".contains(c))
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// queued → running → terminal, plus queued → cancelled. Nothing leaves a
    /// terminal state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        match self {
            SessionState::Queued => {
                matches!(next, SessionState::Running | SessionState::Cancelled)
            }
            SessionState::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Queued => "queued",
            SessionState::Running => "running",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    ToolStart,
    ToolEnd,
    Message,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    pub fn succeeded(summary: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            payload,
            error: None,
        }
    }

    pub fn failed(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            payload: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub request: OperationRequest,
    pub state: SessionState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub events: Vec<ProgressEvent>,
    pub result: Option<OperationResult>,
}

impl Session {
    pub fn new(request: OperationRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            state: SessionState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            events: Vec::new(),
            result: None,
        }
    }

    /// Apply a state change if it moves forward. Returns whether it was applied.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == SessionState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.state = next;
        true
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            kind: self.request.kind,
            repository_context_id: self.request.repository_context_id.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            result: self.result.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub kind: OperationKind,
    pub repository_context_id: String,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn record(&mut self, state: SessionState) {
        match state {
            SessionState::Queued => self.queued += 1,
            SessionState::Running => self.running += 1,
            SessionState::Succeeded => self.succeeded += 1,
            SessionState::Failed => self.failed += 1,
            SessionState::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.succeeded + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub counts: StateCounts,
    pub sessions: Vec<SessionSummary>,
}
