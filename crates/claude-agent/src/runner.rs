use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::event::{translate, AgentEvent};
use crate::stream::QueryStream;
use crate::{ClaudeAgentError, Message, QueryOptions, Result};

// ─── RunConfig ────────────────────────────────────────────────────────────

/// Configuration for a single agentic run.
#[derive(Debug)]
pub struct RunConfig {
    /// The user-facing prompt the agent will act on.
    pub prompt: String,
    /// Query options: model, working directory, allowed tools, etc.
    pub opts: QueryOptions,
    /// Hard limit on wall-clock execution. `None` means unbounded.
    pub timeout: Option<Duration>,
    /// How long the process gets between SIGTERM and a forced kill.
    pub grace_period: Duration,
}

// ─── RunResult ────────────────────────────────────────────────────────────

/// The terminal result of a completed agentic run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub session_id: String,
    /// The final text the agent produced (empty string for error subtypes).
    pub result_text: String,
    pub total_cost_usd: f64,
    pub num_turns: u32,
    /// `true` if the run ended with any error subtype (max_turns, budget, etc.).
    pub is_error: bool,
    pub errors: Vec<String>,
}

// ─── Public API ───────────────────────────────────────────────────────────

/// Drive a single agentic query to completion.
///
/// Every protocol message is translated into [`AgentEvent`]s and handed to
/// `on_event` in emission order. Resolves to the terminal [`RunResult`] only
/// when the process exits with status 0.
///
/// Failure modes:
/// - the binary cannot be started → [`ClaudeAgentError::Spawn`]
/// - non-zero exit, or stdout closes without a result → [`ClaudeAgentError::Process`]
/// - `config.timeout` elapses → the process is terminated, then [`ClaudeAgentError::Timeout`]
/// - `cancel` fires → the process is terminated, then [`ClaudeAgentError::Cancelled`]
///
/// In the last two cases the process has exited by the time this returns.
pub async fn run<F>(config: RunConfig, cancel: &CancellationToken, on_event: F) -> Result<RunResult>
where
    F: FnMut(AgentEvent),
{
    let token = cancel.child_token();
    let stream = QueryStream::new(config.prompt, config.opts, token.clone(), config.grace_period);
    run_stream(stream, token, config.timeout, on_event).await
}

// ─── Internal ─────────────────────────────────────────────────────────────

/// Consume `stream` under an optional deadline.
///
/// `token` must be the token the stream's background task watches, so that a
/// timeout can shut the process down before reporting.
pub(crate) async fn run_stream<F>(
    mut stream: QueryStream,
    token: CancellationToken,
    timeout: Option<Duration>,
    mut on_event: F,
) -> Result<RunResult>
where
    F: FnMut(AgentEvent),
{
    let Some(limit) = timeout else {
        return collect(&mut stream, &mut on_event).await;
    };

    match tokio::time::timeout(limit, collect(&mut stream, &mut on_event)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_secs = limit.as_secs(), "agent run timed out, terminating");
            token.cancel();
            // The stream ends once the background task has reaped the process.
            while stream.next().await.is_some() {}
            Err(ClaudeAgentError::Timeout {
                secs: limit.as_secs(),
            })
        }
    }
}

/// Consume a [`QueryStream`] until it closes and extract the [`RunResult`].
async fn collect<F>(stream: &mut QueryStream, on_event: &mut F) -> Result<RunResult>
where
    F: FnMut(AgentEvent),
{
    let mut run_result: Option<RunResult> = None;
    let mut message_count: u64 = 0;

    while let Some(msg) = stream.next().await {
        let msg = msg?;
        message_count += 1;
        for event in translate(&msg) {
            on_event(event);
        }
        if let Message::Result(r) = &msg {
            run_result = Some(RunResult {
                session_id: r.session_id.clone(),
                result_text: r.result_text().unwrap_or("").to_string(),
                total_cost_usd: r.total_cost_usd,
                num_turns: r.num_turns,
                is_error: r.failed(),
                errors: r.errors.clone(),
            });
        }
    }

    info!(message_count, "agent stream closed");
    run_result
        .ok_or_else(|| ClaudeAgentError::Process("stream ended without a result message".into()))
}

// ─── Tests ────────────────────────────────────────────────────────────────
