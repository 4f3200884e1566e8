//! Executor for agent invocations.
//!
//! The driver only sees the [`Executor`] trait. [`ClaudeExecutor`] implements
//! it on top of the Claude CLI:
//! - Spawn the CLI with `--output-format stream-json`
//! - Parse text, cost, and token usage from the event stream
//! - Stream text to a per-call log file so partial output survives timeouts
//! - Enforce the per-call timeout and honor cancellation by killing the child

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use taskloop_core::{Config, ExecutionOutcome};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages during long-running executions.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for capturing stdout/stderr after process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes of agent text kept in memory per call.
///
/// The log file still receives everything.
pub const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent CLI not found: {0}")]
    NotFound(String),
    #[error("timeout after {secs} seconds")]
    Timeout {
        secs: u32,
        partial: ExecutionOutcome,
    },
    #[error("process failed with exit code {code}")]
    ExitCode {
        code: i32,
        partial: ExecutionOutcome,
    },
    #[error("cancelled")]
    Cancelled { partial: ExecutionOutcome },
}

impl ExecError {
    /// Cost and output reported before the call failed, if any.
    pub fn partial(&self) -> Option<&ExecutionOutcome> {
        match self {
            Self::Timeout { partial, .. }
            | Self::ExitCode { partial, .. }
            | Self::Cancelled { partial } => Some(partial),
            Self::Io(_) | Self::NotFound(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Execution collaborator: runs one prompt through the agent.
///
/// Implementations must be safe to call repeatedly and must return promptly
/// once `cancel` fires.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, cancel: &CancellationToken, prompt: &str) -> Result<ExecutionOutcome>;
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Agent binary (normally `claude`).
    pub bin: PathBuf,
    /// Model to use (e.g., "opus", "sonnet").
    pub model: String,
    /// Timeout per invocation in seconds (0 = no timeout).
    pub timeout_sec: u32,
    pub working_dir: PathBuf,
    /// Directory for per-call logs (`exec-001.log`, ...). `None` disables logs.
    pub log_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("claude"),
            model: "opus".to_string(),
            timeout_sec: 600,
            working_dir: PathBuf::from("."),
            log_dir: None,
        }
    }
}

impl ExecutorConfig {
    /// Create from taskloop-core Config.
    pub fn from_config(config: &Config, working_dir: &Path) -> Self {
        Self {
            bin: config.claude_bin.clone(),
            model: config.model.clone(),
            timeout_sec: config.claude_timeout_sec,
            working_dir: working_dir.to_path_buf(),
            log_dir: Some(config.state_dir.join("logs")),
        }
    }
}

/// Accumulates text and usage from Claude's stream-json events.
#[derive(Debug, Default)]
struct StreamParser {
    text: Vec<u8>,
    truncated: bool,
    saw_delta: bool,
    result_text: Option<String>,
    cost_usd: f64,
    tokens_in: u64,
    tokens_out: u64,
}

impl StreamParser {
    /// Consume one line and return the text it contributes, if any.
    ///
    /// Lines that are not JSON are treated as plain agent text.
    fn feed_line(&mut self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let event = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(event) => event,
            Err(_) => return Some(format!("{trimmed}\n")),
        };

        match event.get("type").and_then(|t| t.as_str()) {
            Some("content_block_delta") => {
                let delta = event.get("delta")?;
                if delta.get("type").and_then(|t| t.as_str()) != Some("text_delta") {
                    return None;
                }
                self.saw_delta = true;
                delta.get("text").and_then(|t| t.as_str()).map(str::to_string)
            }
            Some("assistant") if !self.saw_delta => {
                let content = event.get("message")?.get("content")?.as_array()?;
                let text: String = content
                    .iter()
                    .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
                    .map(|t| format!("{t}\n"))
                    .collect();
                (!text.is_empty()).then_some(text)
            }
            Some("result") => {
                self.cost_usd = event
                    .get("total_cost_usd")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0);
                if let Some(usage) = event.get("usage") {
                    let field = |name: &str| {
                        usage
                            .get(name)
                            .and_then(serde_json::Value::as_u64)
                            .unwrap_or(0)
                    };
                    self.tokens_in = field("input_tokens")
                        + field("cache_creation_input_tokens")
                        + field("cache_read_input_tokens");
                    self.tokens_out = field("output_tokens");
                }
                self.result_text = event
                    .get("result")
                    .and_then(|r| r.as_str())
                    .map(str::to_string);
                None
            }
            other => {
                debug!(event_type = ?other, "ignoring stream-json event");
                None
            }
        }
    }

    /// Append text to the in-memory buffer, respecting the byte limit.
    fn push_text(&mut self, text: &str, max_bytes: usize) {
        if self.truncated {
            return;
        }
        let bytes = text.as_bytes();
        let remaining = max_bytes.saturating_sub(self.text.len());
        if remaining == 0 {
            warn!(max_bytes, "agent output exceeded limit, truncating in-memory buffer");
            self.truncated = true;
            return;
        }
        let to_take = bytes.len().min(remaining);
        self.text.extend_from_slice(&bytes[..to_take]);
        if to_take < bytes.len() {
            self.truncated = true;
        }
    }

    fn into_outcome(self) -> ExecutionOutcome {
        let streamed = String::from_utf8_lossy(&self.text).into_owned();
        let output = if streamed.trim().is_empty() {
            self.result_text.unwrap_or(streamed)
        } else {
            streamed
        };
        ExecutionOutcome {
            output,
            cost_usd: self.cost_usd,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
        }
    }
}

/// Read the agent's stream-json stdout, writing text to `log_path` as it arrives.
async fn stream_agent_json<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    max_bytes: usize,
    log_path: Option<PathBuf>,
) -> std::io::Result<StreamParser> {
    let mut file = match log_path {
        Some(path) => Some(
            tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await?,
        ),
        None => None,
    };

    let mut buf_reader = tokio::io::BufReader::new(reader);
    let mut line = String::new();
    let mut parser = StreamParser::default();

    loop {
        line.clear();
        let n = buf_reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }

        if let Some(text) = parser.feed_line(&line) {
            if let Some(file) = file.as_mut() {
                file.write_all(text.as_bytes()).await?;
            }
            parser.push_text(&text, max_bytes);
        }
    }

    if let Some(file) = file.as_mut() {
        file.flush().await?;
    }
    Ok(parser)
}

/// Read from an async reader with a maximum byte limit.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            // Drain the pipe but discard.
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    Ok(buf)
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Executor backed by the Claude CLI.
#[derive(Debug)]
pub struct ClaudeExecutor {
    config: ExecutorConfig,
    calls: AtomicU32,
}

impl ClaudeExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            calls: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Number the next call and pick its log path: `exec-XXX.log`.
    ///
    /// Numbers already taken by earlier processes (a resumed run) are skipped
    /// so their logs are never overwritten.
    async fn next_call(&self) -> std::io::Result<(u32, Option<PathBuf>)> {
        let Some(dir) = &self.config.log_dir else {
            return Ok((self.calls.fetch_add(1, Ordering::SeqCst) + 1, None));
        };
        tokio::fs::create_dir_all(dir).await?;
        loop {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let path = dir.join(format!("exec-{call:03}.log"));
            if !tokio::fs::try_exists(&path).await? {
                return Ok((call, Some(path)));
            }
        }
    }

    fn command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.config.bin);
        cmd.arg("-p")
            .arg("--verbose")
            .arg("--dangerously-skip-permissions")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(&self.config.model)
            .arg(prompt)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    async fn execute(&self, cancel: &CancellationToken, prompt: &str) -> Result<ExecutionOutcome> {
        let (call, log_path) = self.next_call().await?;

        debug!(
            call,
            bin = %self.config.bin.display(),
            model = %self.config.model,
            working_dir = %self.config.working_dir.display(),
            "spawning agent process"
        );

        let mut child = self.command(prompt).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::NotFound(self.config.bin.display().to_string())
            } else {
                ExecError::Io(e)
            }
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(stream_agent_json(stdout, MAX_OUTPUT_BYTES, log_path)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let started = Instant::now();
        let timeout_duration = Duration::from_secs(u64::from(self.config.timeout_sec));

        let outcome = loop {
            let elapsed = started.elapsed();

            if self.config.timeout_sec > 0 && elapsed >= timeout_duration {
                warn!(
                    call,
                    timeout_sec = self.config.timeout_sec,
                    "agent timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(call, error = %err, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut;
            }

            let remaining_timeout = if self.config.timeout_sec > 0 {
                timeout_duration.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };
            let sleep_duration = HEARTBEAT_INTERVAL.min(remaining_timeout);

            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => break ProcessOutcome::Completed(status),
                        Err(e) => return Err(ExecError::Io(e)),
                    }
                }
                () = cancel.cancelled() => {
                    info!(call, "cancellation requested; killing agent");
                    if let Err(err) = child.kill().await {
                        warn!(call, error = %err, "failed to kill cancelled process");
                    }
                    let _ = child.wait().await;
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    info!(
                        call,
                        elapsed_sec = started.elapsed().as_secs(),
                        timeout_sec = self.config.timeout_sec,
                        "agent still running"
                    );
                }
            }
        };

        // Pipes close after exit or kill, so these finish quickly.
        let parser = match stdout_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(parser))) => parser,
                Ok(Ok(Err(err))) => {
                    warn!(call, error = %err, "stdout capture failed");
                    StreamParser::default()
                }
                Ok(Err(err)) => {
                    warn!(call, error = %err, "stdout task panicked");
                    StreamParser::default()
                }
                Err(_) => {
                    warn!(call, "stdout capture timed out");
                    StreamParser::default()
                }
            },
            None => StreamParser::default(),
        };
        let stderr = match stderr_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(buf))) => buf,
                _ => Vec::new(),
            },
            None => Vec::new(),
        };

        let result = parser.into_outcome();
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            ProcessOutcome::TimedOut => {
                info!(
                    call,
                    duration_ms,
                    output_bytes = result.output.len(),
                    "agent timed out (partial output kept)"
                );
                Err(ExecError::Timeout {
                    secs: self.config.timeout_sec,
                    partial: result,
                })
            }
            ProcessOutcome::Cancelled => {
                info!(
                    call,
                    duration_ms,
                    output_bytes = result.output.len(),
                    "agent cancelled (partial output kept)"
                );
                Err(ExecError::Cancelled { partial: result })
            }
            ProcessOutcome::Completed(status) => {
                let code = status.code().unwrap_or(-1);
                info!(
                    call,
                    exit_code = code,
                    duration_ms,
                    output_bytes = result.output.len(),
                    cost_usd = result.cost_usd,
                    tokens_in = result.tokens_in,
                    tokens_out = result.tokens_out,
                    "agent execution complete"
                );
                if code != 0 {
                    if !stderr.is_empty() {
                        warn!(call, stderr = %String::from_utf8_lossy(&stderr), "agent stderr");
                    }
                    return Err(ExecError::ExitCode {
                        code,
                        partial: result,
                    });
                }
                Ok(result)
            }
        }
    }
}
