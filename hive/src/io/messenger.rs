//! Messenger port: the single blocking LLM call.
//!
//! The [`Messenger`] trait decouples agents from the model backend (currently
//! a CLI invoked per call). Tests use scripted messengers that return
//! predetermined replies without spawning processes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::estimate_tokens;
use crate::io::config::MessengerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessengerReply {
    pub text: String,
    /// Opaque token used to resume the conversation on the next call.
    pub continuation_token: Option<String>,
    /// Tokens consumed by this call, when the backend reports them.
    pub tokens_used: Option<u64>,
}

impl MessengerReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            continuation_token: None,
            tokens_used: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }

    pub fn with_usage(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// Transient messenger failures. Both are retried by the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessengerError {
    #[error("messenger unavailable: {0}")]
    Unavailable(String),
    #[error("messenger timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn query(
        &self,
        prompt: &str,
        continuation_token: Option<&str>,
    ) -> Result<MessengerReply, MessengerError>;
}

/// Messenger that spawns a CLI per call (default `claude -p --output-format json`).
///
/// The prompt is written to stdin. A continuation token is passed as
/// `<resume_flag> <token>`. JSON output of the form
/// `{"result": ..., "session_id": ..., "usage": {...}}` is parsed; any other
/// stdout is taken verbatim as the reply text.
pub struct CliMessenger {
    command: Vec<String>,
    resume_flag: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CliMessenger {
    pub fn new(config: &MessengerConfig) -> Self {
        Self {
            command: config.command.clone(),
            resume_flag: config.resume_flag.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    fn build_command(&self, continuation_token: Option<&str>) -> Result<Command, MessengerError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| MessengerError::Unavailable("messenger command is empty".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(token) = continuation_token {
            cmd.arg(&self.resume_flag).arg(token);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn run(
        &self,
        prompt: &str,
        continuation_token: Option<&str>,
    ) -> Result<MessengerReply, MessengerError> {
        let mut child = self
            .build_command(continuation_token)?
            .spawn()
            .map_err(|err| MessengerError::Unavailable(format!("spawn messenger: {err}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MessengerError::Unavailable("stdin was not piped".into()))?;
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|err| MessengerError::Unavailable(format!("write prompt: {err}")))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MessengerError::Unavailable("stdout was not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MessengerError::Unavailable("stderr was not piped".into()))?;

        let limit = self.output_limit_bytes;
        let (read_out, read_err, status) = tokio::join!(
            read_limited(stdout, limit),
            read_limited(stderr, limit),
            child.wait(),
        );
        let (out, out_truncated) =
            read_out.map_err(|e| MessengerError::Unavailable(format!("read stdout: {e}")))?;
        let (err, err_truncated) =
            read_err.map_err(|e| MessengerError::Unavailable(format!("read stderr: {e}")))?;
        let status = status.map_err(|e| MessengerError::Unavailable(format!("wait: {e}")))?;
        if out_truncated > 0 || err_truncated > 0 {
            warn!(out_truncated, err_truncated, "messenger output truncated");
        }

        if !status.success() {
            let stderr = String::from_utf8_lossy(&err);
            warn!(exit_code = ?status.code(), "messenger command failed");
            return Err(MessengerError::Unavailable(format!(
                "messenger exited with {:?}: {}",
                status.code(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&out);
        parse_cli_output(&stdout, prompt, continuation_token)
    }
}

#[async_trait]
impl Messenger for CliMessenger {
    #[instrument(skip_all, fields(prompt_bytes = prompt.len(), resuming = continuation_token.is_some()))]
    async fn query(
        &self,
        prompt: &str,
        continuation_token: Option<&str>,
    ) -> Result<MessengerReply, MessengerError> {
        info!(command = %self.command[0], "invoking messenger");
        match tokio::time::timeout(self.timeout, self.run(prompt, continuation_token)).await {
            Ok(result) => result,
            Err(_) => Err(MessengerError::Timeout(self.timeout)),
        }
    }
}

/// Read `reader` to the end, keeping at most `limit` bytes.
///
/// The rest is drained and counted so the child never blocks on a full pipe.
async fn read_limited<R>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }
    Ok((buf, truncated))
}

#[derive(Debug, Deserialize)]
struct CliEnvelope {
    result: Option<String>,
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
    usage: Option<CliUsage>,
}

#[derive(Debug, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn parse_cli_output(
    stdout: &str,
    prompt: &str,
    continuation_token: Option<&str>,
) -> Result<MessengerReply, MessengerError> {
    let trimmed = stdout.trim();
    match serde_json::from_str::<CliEnvelope>(trimmed) {
        Ok(envelope) => {
            let text = envelope.result.unwrap_or_default();
            if envelope.is_error {
                return Err(MessengerError::Unavailable(format!(
                    "messenger reported an error: {text}"
                )));
            }
            let tokens_used = envelope
                .usage
                .map(|usage| usage.input_tokens + usage.output_tokens)
                .unwrap_or_else(|| estimate_tokens(prompt, &text));
            debug!(tokens_used, "parsed messenger envelope");
            Ok(MessengerReply {
                text,
                continuation_token: envelope
                    .session_id
                    .or_else(|| continuation_token.map(str::to_string)),
                tokens_used: Some(tokens_used),
            })
        }
        Err(_) => Ok(MessengerReply {
            text: trimmed.to_string(),
            continuation_token: continuation_token.map(str::to_string),
            tokens_used: None,
        }),
    }
}
