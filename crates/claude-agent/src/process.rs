use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{Message, QueryOptions};
use crate::{ClaudeAgentError, Result};

// ─── AgentProcess ─────────────────────────────────────────────────────────

/// A running `claude --output-format stream-json --input-format stream-json`
/// subprocess.
///
/// The prompt is sent as a JSON message on stdin and responses are read as
/// JSONL from stdout. Stderr is captured in a background task and surfaced
/// when the process exits non-zero.
pub(crate) struct AgentProcess {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stdin: Option<ChildStdin>,
    stderr_buf: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl AgentProcess {
    /// Spawn the agent binary with the given prompt and options.
    ///
    /// `CLAUDECODE` is removed from the environment so this works when the
    /// server itself runs inside an agent session.
    pub(crate) async fn spawn(prompt: &str, opts: &QueryOptions) -> Result<Self> {
        let mut cmd = build_command(opts);
        cmd.env_remove("CLAUDECODE");
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let mut process = Self::from_command(cmd, opts.executable())?;

        let user_msg = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "text", "text": prompt}]
            }
        });
        process.send_message(&user_msg).await?;
        process.close_stdin();

        Ok(process)
    }

    /// Spawn an arbitrary command in place of the agent binary.
    #[cfg(test)]
    pub(crate) fn spawn_command(cmd: Command) -> Result<Self> {
        Self::from_command(cmd, "mock")
    }

    fn from_command(mut cmd: Command, executable: &str) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ClaudeAgentError::Spawn {
            executable: executable.to_string(),
            source,
        })?;
        debug!(executable, pid = ?child.id(), "agent process spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClaudeAgentError::Process("stdout not captured".into()))?;

        let stdin = child.stdin.take();

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Ok(mut b) = buf.lock() {
                        if !b.is_empty() {
                            b.push('\n');
                        }
                        b.push_str(&line);
                    }
                }
            })
        });

        Ok(Self {
            child,
            lines: BufReader::new(stdout).lines(),
            stdin,
            stderr_buf,
            stderr_task,
        })
    }

    async fn send_message(&mut self, msg: &serde_json::Value) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ClaudeAgentError::Process("stdin already closed".into()))?;

        let mut buf = serde_json::to_vec(msg).map_err(|e| {
            ClaudeAgentError::Process(format!("failed to serialize stdin message: {e}"))
        })?;
        buf.push(b'\n');

        stdin.write_all(&buf).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Read the next non-empty JSONL line from stdout and deserialize it.
    ///
    /// Lines whose `"type"` is not modelled (e.g. `rate_limit_event`,
    /// `tool_progress`) are skipped. Returns `Ok(None)` on EOF.
    pub(crate) async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(trimmed) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    if is_unknown_message_type(trimmed) {
                        continue;
                    }
                    return Err(ClaudeAgentError::Parse {
                        line: trimmed.to_owned(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Wait for the child to exit and return an error if the exit code is
    /// non-zero or the process was killed by a signal. Captured stderr is
    /// included in the error message.
    pub(crate) async fn wait_exit_error(&mut self) -> Option<ClaudeAgentError> {
        let status = match self.child.wait().await {
            Ok(s) => s,
            Err(e) => return Some(ClaudeAgentError::Io(e)),
        };

        if status.success() {
            return None;
        }

        // Let the reader drain whatever the process wrote before exiting.
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        let stderr = self
            .stderr_buf
            .lock()
            .ok()
            .map(|b| b.clone())
            .unwrap_or_default();

        let head = match status.code() {
            Some(code) => format!("agent process exited with code {code}"),
            None => "agent process terminated by signal".to_string(),
        };
        let msg = if stderr.is_empty() {
            head
        } else {
            format!("{head}\nstderr: {stderr}")
        };
        Some(ClaudeAgentError::Process(msg))
    }

    /// Ask the process to stop, escalating to a hard kill once `grace`
    /// elapses. Returns once the process has exited.
    pub(crate) async fn terminate(&mut self, grace: Duration) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        send_sigterm(&self.child);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => debug!("agent process exited within grace period"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "agent ignored SIGTERM, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM delivery failed");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &Child) {
    // No soft signal available; the grace timeout falls through to kill().
    let _ = child.id();
}

/// A valid JSON line with a `"type"` field we don't model is skipped; anything
/// else is a genuine parse error.
fn is_unknown_message_type(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .map(|v| {
            matches!(
                v.get("type").and_then(|t| t.as_str()),
                Some(t) if !matches!(t, "system" | "assistant" | "user" | "result")
            )
        })
        .unwrap_or(false)
}

// ─── Command builder ──────────────────────────────────────────────────────

fn build_command(opts: &QueryOptions) -> Command {
    let mut cmd = Command::new(opts.executable());

    cmd.arg("--print")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--input-format")
        .arg("stream-json");

    if let Some(model) = &opts.model {
        cmd.arg("--model").arg(model);
    }

    if let Some(max_turns) = opts.max_turns {
        cmd.arg("--max-turns").arg(max_turns.to_string());
    }

    if !opts.allowed_tools.is_empty() {
        cmd.arg("--allowed-tools").args(&opts.allowed_tools);
    }

    if let Some(append) = &opts.append_system_prompt {
        cmd.arg("--append-system-prompt").arg(append);
    }

    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }

    cmd
}
