use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─── Outer Message enum ───────────────────────────────────────────────────

/// The subset of `claude --output-format stream-json` messages the driver
/// understands. Discriminated by the JSON `"type"` field; lines with any
/// other type are skipped by the reader.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    System(SystemMessage),
    Assistant(AssistantMessage),
    User(UserMessage),
    Result(ResultMessage),
}

impl Message {
    pub fn session_id(&self) -> &str {
        match self {
            Message::System(m) => &m.session_id,
            Message::Assistant(m) => &m.session_id,
            Message::User(m) => &m.session_id,
            Message::Result(m) => &m.session_id,
        }
    }

    /// Returns `Some(&ResultMessage)` if this is the terminal result message.
    pub fn as_result(&self) -> Option<&ResultMessage> {
        if let Message::Result(r) = self {
            Some(r)
        } else {
            None
        }
    }
}

// ─── System messages ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemMessage {
    pub session_id: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

// ─── Assistant messages ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub message: AssistantContent,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantContent {
    #[serde(default)]
    pub id: Option<String>,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Content blocks within an assistant message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Tool inputs are schema-polymorphic (varies per tool).
        input: serde_json::Value,
    },
    Thinking {
        thinking: String,
    },
}

// ─── User messages ────────────────────────────────────────────────────────

/// `type = "user"`: tool results fed back to the model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub message: UserContent,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserContent {
    pub role: String,
    pub content: UserContentBody,
}

/// The CLI sends either a plain string or a list of blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum UserContentBody {
    Text(String),
    Blocks(Vec<UserContentBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContentBlock {
    Text {
        text: String,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultBody>,
        #[serde(default)]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultBody {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

impl ToolResultBody {
    /// Flatten the body into plain text, keeping only `text` blocks.
    pub fn to_text(&self) -> String {
        match self {
            ToolResultBody::Text(s) => s.clone(),
            ToolResultBody::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ─── Result messages ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    ErrorDuringExecution,
    ErrorMaxTurns,
    ErrorMaxBudgetUsd,
    #[serde(other)]
    Other,
}

/// `type = "result"`: the terminal message in every query stream. Error
/// subtypes carry `errors` instead of `result`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultMessage {
    pub subtype: ResultSubtype,
    pub session_id: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultMessage {
    /// An error subtype, or a success the CLI itself flagged as an error.
    pub fn failed(&self) -> bool {
        self.is_error || self.subtype != ResultSubtype::Success
    }

    pub fn result_text(&self) -> Option<&str> {
        match self.subtype {
            ResultSubtype::Success => self.result.as_deref(),
            _ => None,
        }
    }
}

// ─── QueryOptions ─────────────────────────────────────────────────────────

/// Options for driving a Claude subprocess query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Claude model name (e.g. `"claude-sonnet-4-6"`)
    pub model: Option<String>,
    /// Maximum number of agentic turns before stopping with `error_max_turns`
    pub max_turns: Option<u32>,
    /// Tool names that are auto-approved without user prompting
    pub allowed_tools: Vec<String>,
    /// Text to append to the default system prompt
    pub append_system_prompt: Option<String>,
    /// Working directory for the subprocess (default: current dir)
    pub cwd: Option<std::path::PathBuf>,
    /// Extra environment for the subprocess
    pub env: HashMap<String, String>,
    /// Custom path to the `claude` binary (default: `"claude"`)
    pub path_to_executable: Option<String>,
}

impl QueryOptions {
    pub fn executable(&self) -> &str {
        self.path_to_executable.as_deref().unwrap_or("claude")
    }
}
