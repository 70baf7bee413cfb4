use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::process::AgentProcess;
use crate::types::{Message, QueryOptions};
use crate::{ClaudeAgentError, Result};

// ─── QueryStream ──────────────────────────────────────────────────────────

/// An async stream of [`Message`]s from an agent subprocess.
///
/// Backed by a Tokio mpsc channel. A background task owns the process and
/// forwards messages until stdout closes, then surfaces a non-zero exit as a
/// final `Err`. Cancelling the token terminates the process (SIGTERM, then a
/// hard kill after `grace`) and yields [`ClaudeAgentError::Cancelled`] as the
/// last item, so a consumer that sees `Cancelled` knows the process is gone.
pub struct QueryStream {
    rx: mpsc::Receiver<Result<Message>>,
}

impl QueryStream {
    pub(crate) fn new(
        prompt: String,
        opts: QueryOptions,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            if cancel.is_cancelled() {
                let _ = tx.send(Err(ClaudeAgentError::Cancelled)).await;
                return;
            }
            let mut process = match AgentProcess::spawn(&prompt, &opts).await {
                Ok(p) => p,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            pump(&mut process, &tx, &cancel, grace).await;
        });

        QueryStream { rx }
    }

    /// Wrap a raw mpsc receiver as a `QueryStream`.
    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::Receiver<Result<Message>>) -> Self {
        Self { rx }
    }
}

/// Forward messages from `process` into `tx` until EOF, error or cancellation.
pub(crate) async fn pump(
    process: &mut AgentProcess,
    tx: &mpsc::Sender<Result<Message>>,
    cancel: &CancellationToken,
    grace: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("cancellation requested, terminating agent");
                process.terminate(grace).await;
                let _ = tx.send(Err(ClaudeAgentError::Cancelled)).await;
                return;
            }
            next = process.next_message() => match next {
                Ok(Some(msg)) => {
                    if tx.send(Ok(msg)).await.is_err() {
                        // Receiver dropped; nobody is listening any more.
                        process.terminate(grace).await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    process.terminate(grace).await;
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            process.terminate(grace).await;
            let _ = tx.send(Err(ClaudeAgentError::Cancelled)).await;
        }
        exit_err = process.wait_exit_error() => {
            if let Some(e) = exit_err {
                let _ = tx.send(Err(e)).await;
            }
        }
    }
}

impl Stream for QueryStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultSubtype;
    use futures::StreamExt;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::process::Command;

    /// Drive `cmd` through `pump` exactly as `QueryStream::new` would.
    fn stream_from(cmd: Command, cancel: CancellationToken) -> QueryStream {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut process = AgentProcess::spawn_command(cmd).unwrap();
            pump(&mut process, &tx, &cancel, Duration::from_millis(200)).await;
        });
        QueryStream { rx }
    }

    /// Write JSON lines to a temp file, then `cat` it as the mock process.
    fn mock_stream(lines: &[&str]) -> QueryStream {
        let mut f = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        let (_, path) = f.keep().unwrap();
        let mut cmd = Command::new("cat");
        cmd.arg(&path);
        stream_from(cmd, CancellationToken::new())
    }

    const INIT_LINE: &str = r#"{"type":"system","subtype":"init","session_id":"s1","model":"m","cwd":"/tmp"}"#;
    const RESULT_LINE: &str = r#"{"type":"result","subtype":"success","session_id":"s1","result":"Hello from mock!","is_error":false,"num_turns":1,"total_cost_usd":0.0}"#;

    #[tokio::test]
    async fn stream_yields_all_messages() {
        let stream = mock_stream(&[INIT_LINE, RESULT_LINE]);
        let messages: Vec<_> = stream.collect().await;
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.is_ok()));
    }

    #[tokio::test]
    async fn stream_skips_unmodelled_types_and_blank_lines() {
        let stream = mock_stream(&[
            INIT_LINE,
            "",
            r#"{"type":"rate_limit_event","session_id":"s1"}"#,
            "  ",
            RESULT_LINE,
        ]);
        let messages: Vec<_> = stream.collect().await;
        assert_eq!(messages.len(), 2);
        let last = messages.last().unwrap().as_ref().unwrap();
        assert!(matches!(last, Message::Result(r) if r.subtype == ResultSubtype::Success));
    }

    #[tokio::test]
    async fn stream_reports_non_zero_exit_with_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo boom >&2; exit 3");
        let messages: Vec<_> = stream_from(cmd, CancellationToken::new()).collect().await;
        assert_eq!(messages.len(), 1);
        let err = messages[0].as_ref().unwrap_err().to_string();
        assert!(err.contains("code 3"), "{err}");
        assert!(err.contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn stream_surfaces_parse_errors() {
        let stream = mock_stream(&["{not json"]);
        let messages: Vec<_> = stream.collect().await;
        assert!(matches!(
            messages.last().unwrap(),
            Err(ClaudeAgentError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_terminates_process_and_ends_with_cancelled() {
        let cancel = CancellationToken::new();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mut stream = stream_from(cmd, cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let item = stream.next().await.unwrap();
        assert!(matches!(item, Err(ClaudeAgentError::Cancelled)));
        assert!(stream.next().await.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
