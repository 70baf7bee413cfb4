use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use claude_agent::{AgentEvent, QueryOptions, RunConfig};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AgentConfig;
use crate::error::{GitPilotError, Result};
use crate::prompt;
use crate::types::ProgressKind;

/// Receives progress from a running agent, in emission order.
pub type EventSink = Arc<dyn Fn(ProgressKind, serde_json::Value) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub text: String,
    pub cost_usd: f64,
    pub turns: u32,
}

/// Runs an AI agent over a working tree.
///
/// Implementations must have stopped the agent process by the time `run`
/// returns, including when `cancel` fires.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        cwd: &Path,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Result<AgentOutcome>;
}

/// [`AgentRunner`] backed by the `claude` CLI.
pub struct ClaudeRunner {
    config: AgentConfig,
}

impl ClaudeRunner {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn options(&self, cwd: &Path) -> QueryOptions {
        QueryOptions {
            model: self.config.model.clone(),
            max_turns: Some(self.config.max_turns),
            allowed_tools: self.config.allowed_tools.clone(),
            append_system_prompt: Some(prompt::SYSTEM_PREAMBLE.to_string()),
            cwd: Some(cwd.to_path_buf()),
            env: prompt::AGENT_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            path_to_executable: Some(self.config.executable.clone()),
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run(
        &self,
        prompt: &str,
        cwd: &Path,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Result<AgentOutcome> {
        let config = RunConfig {
            prompt: prompt.to_string(),
            opts: self.options(cwd),
            timeout: Some(self.config.timeout()),
            grace_period: self.config.grace_period(),
        };

        let result = claude_agent::agent_run(config, &cancel, move |event| {
            let (kind, payload) = progress_of(event);
            events(kind, payload);
        })
        .await?;

        info!(
            turns = result.num_turns,
            cost_usd = result.total_cost_usd,
            "agent run finished"
        );

        if result.is_error {
            let detail = if result.errors.is_empty() {
                "agent reported an error".to_string()
            } else {
                result.errors.join("; ")
            };
            return Err(GitPilotError::Command {
                command: self.config.executable.clone(),
                stderr: detail,
            });
        }

        Ok(AgentOutcome {
            text: result.result_text,
            cost_usd: result.total_cost_usd,
            turns: result.num_turns,
        })
    }
}

fn progress_of(event: AgentEvent) -> (ProgressKind, serde_json::Value) {
    match event {
        AgentEvent::ToolStart {
            tool_use_id,
            name,
            input,
        } => (
            ProgressKind::ToolStart,
            json!({"toolUseId": tool_use_id, "name": name, "input": input}),
        ),
        AgentEvent::ToolEnd {
            tool_use_id,
            is_error,
            output,
        } => (
            ProgressKind::ToolEnd,
            json!({"toolUseId": tool_use_id, "isError": is_error, "output": output}),
        ),
        AgentEvent::Message { text } => (ProgressKind::Message, json!({"text": text})),
        AgentEvent::Error { message } => (ProgressKind::Error, json!({"message": message})),
    }
}
