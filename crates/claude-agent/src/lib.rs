//! `claude-agent`: native Rust driver for the Claude CLI subprocess.
//!
//! Implements the `--output-format stream-json` protocol with the two things
//! a server needs on top of plain parsing: a hard execution timeout and
//! cooperative cancellation that always reaps the process.
//!
//! # Architecture
//!
//! ```text
//! RunConfig + CancellationToken
//!     │
//!     ▼
//! AgentProcess    ← spawns `claude --print --output-format stream-json …`
//!     │              prompt on stdin, JSONL on stdout, stderr captured
//!     ▼
//! QueryStream     ← background task + mpsc channel; SIGTERM → grace → kill
//!     │
//!     ▼
//! runner::run     ← translates Message → AgentEvent, enforces the timeout
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use claude_agent::{agent_run, QueryOptions, RunConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let cancel = CancellationToken::new();
//! let result = agent_run(
//!     RunConfig {
//!         prompt: "Write a commit message for the staged diff.".into(),
//!         opts: QueryOptions::default(),
//!         timeout: Some(std::time::Duration::from_secs(600)),
//!         grace_period: std::time::Duration::from_secs(5),
//!     },
//!     &cancel,
//!     |event| println!("{event:?}"),
//! )
//! .await?;
//! println!("{}", result.result_text);
//! ```

pub mod error;
pub mod event;
pub mod runner;
pub mod types;

pub(crate) mod process;
pub mod stream;


pub use error::ClaudeAgentError;
pub use event::AgentEvent;
pub use runner::{run as agent_run, RunConfig, RunResult};
pub use stream::QueryStream;
pub use types::{
    AssistantContent, AssistantMessage, ContentBlock, Message, QueryOptions, ResultMessage,
    ResultSubtype, SystemMessage, UserMessage,
};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, ClaudeAgentError>;
