use bytes::{Buf, BytesMut};
use futures::StreamExt;
use serde::Deserialize;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::binary::CliBinary;
use crate::config::BridgeConfig;
use crate::error::{truncate_str, BridgeError};
use crate::translate::InvocationDescriptor;
use crate::types::Usage;

// Whole assistant messages arrive on a single NDJSON line.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;
const STDERR_LIMIT_CHARS: usize = 2000;
const EVENT_BUFFER: usize = 100;

/// Lifecycle of one CLI subprocess.
///
/// `Spawning -> Running -> {Succeeded, Failed, TimedOut, Killed}`; a spawn
/// error goes straight from `Spawning` to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Spawning,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Killed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvocationState::Spawning | InvocationState::Running)
    }

    pub fn can_transition_to(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Spawning, Running)
                | (Spawning, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Killed)
        )
    }
}

/// One item of CLI output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliEvent {
    /// Newly generated text, in emission order.
    Delta(String),
    /// Clean exit. Always the last item of a successful invocation.
    Finished(Usage),
}

struct Lifecycle {
    tx: watch::Sender<InvocationState>,
}

impl Lifecycle {
    fn advance(&self, next: InvocationState) {
        let current = *self.tx.borrow();
        debug_assert!(
            current.can_transition_to(next),
            "invalid transition {current:?} -> {next:?}"
        );
        tracing::debug!(from = ?current, to = ?next, "claude CLI state change");
        self.tx.send_replace(next);
    }
}

/// A running claude CLI invocation, consumed as a stream of [`CliEvent`]s.
///
/// The stream ends after `Finished` or after a single error. Dropping it
/// before then kills the subprocess.
pub struct CliProcess {
    events: ReceiverStream<Result<CliEvent, BridgeError>>,
    state: watch::Receiver<InvocationState>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl std::fmt::Debug for CliProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliProcess")
            .field("state", &*self.state.borrow())
            .field("events", &"<ReceiverStream>")
            .finish()
    }
}

/// Arguments for one invocation. The prompt is deliberately absent: it goes
/// through stdin so its size is not bounded by the OS argument limit.
pub fn cli_args(descriptor: &InvocationDescriptor, config: &BridgeConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-p".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
        "--model".into(),
        descriptor.model.as_str().into(),
    ];

    if let Some(system) = &descriptor.system_prompt {
        args.push("--append-system-prompt".into());
        args.push(system.clone());
    }

    if let Some(session_id) = &descriptor.session_id {
        args.push("--resume".into());
        args.push(session_id.clone());
    }

    if config.skip_permissions {
        args.push("--dangerously-skip-permissions".into());
    }

    if config.partial_messages {
        args.push("--include-partial-messages".into());
    }

    args
}

impl CliProcess {
    /// Start the CLI for `descriptor`.
    ///
    /// `permit` is an admission slot; it is released once the subprocess has
    /// reached a terminal state.
    pub fn spawn(
        binary: &CliBinary,
        descriptor: InvocationDescriptor,
        config: &BridgeConfig,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Self, BridgeError> {
        let (state_tx, state_rx) = watch::channel(InvocationState::Spawning);
        let lifecycle = Lifecycle { tx: state_tx };

        let mut cmd = Command::new(binary.path());
        cmd.args(cli_args(&descriptor, config))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        tracing::info!(
            model = %descriptor.model,
            prompt_length = descriptor.prompt.len(),
            has_system_prompt = descriptor.system_prompt.is_some(),
            session_id = descriptor.session_id.as_deref().unwrap_or(""),
            "Spawning claude CLI"
        );
        tracing::trace!(prompt = %descriptor.prompt, "Full prompt text");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                lifecycle.advance(InvocationState::Failed);
                tracing::error!(error = %e, path = %binary.path().display(), "Failed to spawn claude CLI");
                return Err(match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        BridgeError::CliUnavailable(format!(
                            "failed to start {}: {}",
                            binary.path().display(),
                            e
                        ))
                    }
                    _ => BridgeError::Io(e),
                });
            }
        };
        lifecycle.advance(InvocationState::Running);

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                lifecycle.advance(InvocationState::Failed);
                return Err(BridgeError::Io(std::io::Error::other(
                    "failed to capture claude CLI stdio",
                )));
            }
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        tokio::spawn(write_prompt(stdin, descriptor.prompt));
        let stderr_handle = tokio::spawn(collect_stderr(stderr));

        let run = Run {
            child,
            lines: FramedRead::new(stdout, LossyLines::new(MAX_LINE_BYTES)),
            parser: OutputParser::new(config.partial_messages),
            tx,
            cancel: cancel.clone(),
            lifecycle,
            timeout: config.timeout,
            _permit: permit,
        };
        tokio::spawn(run.drive(stderr_handle));

        Ok(Self {
            events: ReceiverStream::new(rx),
            state: state_rx,
            _guard: cancel.clone().drop_guard(),
            cancel,
        })
    }

    pub fn state(&self) -> InvocationState {
        *self.state.borrow()
    }

    /// A receiver that outlives this handle, for observing the final state.
    pub fn watch_state(&self) -> watch::Receiver<InvocationState> {
        self.state.clone()
    }

    /// Kill the subprocess. Nothing further is delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for CliProcess {
    type Item = Result<CliEvent, BridgeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

async fn write_prompt(mut stdin: ChildStdin, prompt: String) {
    if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
        tracing::debug!(error = %e, "Failed writing prompt to claude CLI stdin");
        return;
    }
    // EOF on stdin marks the end of the prompt.
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!(error = %e, "Failed closing claude CLI stdin");
    }
}

/// Drains stderr until EOF. The pipe must stay open for the whole run or the
/// CLI dies of SIGPIPE on its next diagnostic write.
async fn collect_stderr(stderr: ChildStderr) -> String {
    let mut lines = FramedRead::new(stderr, LossyLines::new(MAX_LINE_BYTES));
    let mut output = String::new();
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(error = %e, "Failed reading claude CLI stderr");
                break;
            }
        };
        tracing::debug!(target: "claude_cli", "stderr: {}", line);
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}

/// Newline-delimited text, decoded lossily.
///
/// Unlike `LinesCodec`, which ends the stream on the first invalid UTF-8 or
/// overlong line, a bad line here is replaced or dropped and decoding goes on.
#[derive(Debug)]
pub(crate) struct LossyLines {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl LossyLines {
    pub(crate) fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Decoder for LossyLines {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, std::io::Error> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);
            self.next_index = 0;

            match newline {
                Some(idx) if self.discarding => {
                    buf.advance(idx + 1);
                    self.discarding = false;
                }
                Some(idx) if idx > self.max_length => {
                    tracing::warn!(length = idx, "Dropping overlong claude CLI output line");
                    buf.advance(idx + 1);
                }
                Some(idx) => {
                    let line = buf.split_to(idx + 1);
                    let text = String::from_utf8_lossy(&line[..idx]);
                    return Ok(Some(text.trim_end_matches('\r').to_string()));
                }
                None if self.discarding => {
                    buf.clear();
                    return Ok(None);
                }
                None if buf.len() > self.max_length => {
                    tracing::warn!(length = buf.len(), "Dropping overlong claude CLI output line");
                    buf.clear();
                    self.discarding = true;
                    return Ok(None);
                }
                None => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, std::io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() || self.discarding {
            buf.clear();
            return Ok(None);
        }
        let line = buf.split();
        Ok(Some(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string()))
    }
}

enum Exit {
    Status(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Killed,
}

struct Run {
    child: Child,
    lines: FramedRead<tokio::process::ChildStdout, LossyLines>,
    parser: OutputParser,
    tx: mpsc::Sender<Result<CliEvent, BridgeError>>,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
    timeout: std::time::Duration,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Run {
    async fn drive(mut self, stderr_handle: tokio::task::JoinHandle<String>) {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut stdout_open = true;
        let exit = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Exit::Killed,
                _ = &mut deadline => break Exit::TimedOut,
                line = self.lines.next(), if stdout_open => match line {
                    Some(Ok(line)) => {
                        if let Some(delta) = self.parser.feed(&line) {
                            // A slow consumer must not hold off the deadline or a cancel.
                            tokio::select! {
                                _ = self.cancel.cancelled() => break Exit::Killed,
                                _ = &mut deadline => break Exit::TimedOut,
                                sent = self.tx.send(Ok(CliEvent::Delta(delta))) => {
                                    if sent.is_err() {
                                        break Exit::Killed;
                                    }
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Failed reading claude CLI stdout");
                        stdout_open = false;
                    }
                    None => stdout_open = false,
                },
                status = self.child.wait(), if !stdout_open => match status {
                    Ok(status) => break Exit::Status(status),
                    Err(e) => break Exit::WaitFailed(e),
                },
            }
        };

        match exit {
            Exit::Killed => {
                tracing::info!("Claude CLI invocation cancelled, killing process");
                let _ = self.child.kill().await;
                self.lifecycle.advance(InvocationState::Killed);
            }
            Exit::TimedOut => {
                tracing::warn!(timeout = ?self.timeout, "Claude CLI timed out, killing process");
                let _ = self.child.kill().await;
                self.lifecycle.advance(InvocationState::TimedOut);
                let _ = self.tx.send(Err(BridgeError::Timeout(self.timeout))).await;
            }
            Exit::WaitFailed(e) => {
                tracing::error!(error = %e, "Failed waiting for claude CLI");
                self.lifecycle.advance(InvocationState::Failed);
                let _ = self.tx.send(Err(BridgeError::Io(e))).await;
            }
            Exit::Status(status) => {
                let stderr = stderr_handle.await.unwrap_or_default();
                let result = self.parser.finish(status, &stderr);
                match &result {
                    Ok(usage) => {
                        tracing::info!(
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "Claude CLI completed"
                        );
                        self.lifecycle.advance(InvocationState::Succeeded);
                    }
                    Err(e) => {
                        tracing::error!(status = %status, error = %e, "Claude CLI failed");
                        self.lifecycle.advance(InvocationState::Failed);
                    }
                }
                let _ = self.tx.send(result.map(CliEvent::Finished)).await;
            }
        }
    }
}

// --- stream-json output ----------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    message: Option<AssistantMessage>,
    #[serde(default)]
    event: Option<PartialEvent>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    usage: Option<CliUsage>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartialEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<ContentBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
}

/// Incremental decoder for `--output-format stream-json`.
#[derive(Debug, Default)]
pub(crate) struct OutputParser {
    partial_messages: bool,
    emitted_text: bool,
    needs_separator: bool,
    usage: Usage,
    saw_result: bool,
    error_result: Option<String>,
}

impl OutputParser {
    pub(crate) fn new(partial_messages: bool) -> Self {
        Self {
            partial_messages,
            ..Self::default()
        }
    }

    /// Decode one stdout line; returns text to forward, if any.
    pub(crate) fn feed(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let event: StreamLine = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) => {
                tracing::trace!(target: "claude_cli", "Skipping non-JSON line: {}", truncate_str(line, 100));
                return None;
            }
        };

        match event.kind.as_str() {
            "system" => {
                if let Some(sid) = &event.session_id {
                    tracing::debug!(session_id = %sid, "Claude CLI session");
                }
                None
            }
            "assistant" if !self.partial_messages => {
                let text = event
                    .message?
                    .content
                    .into_iter()
                    .filter(|block| block.kind == "text")
                    .filter_map(|block| block.text)
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                self.emit(text)
            }
            "stream_event" if self.partial_messages => {
                let partial = event.event?;
                match partial.kind.as_str() {
                    "message_start" => {
                        self.needs_separator = self.emitted_text;
                        None
                    }
                    "content_block_delta" => {
                        let delta = partial.delta?;
                        if delta.kind != "text_delta" {
                            return None;
                        }
                        self.emit(delta.text?)
                    }
                    _ => None,
                }
            }
            "result" => {
                self.saw_result = true;
                if let Some(usage) = &event.usage {
                    let prompt = usage
                        .input_tokens
                        .saturating_add(usage.cache_creation_input_tokens)
                        .saturating_add(usage.cache_read_input_tokens);
                    self.usage = Usage::new(prompt, usage.output_tokens);
                }
                let result_text = event
                    .result
                    .as_ref()
                    .and_then(|r| r.as_str())
                    .unwrap_or_default()
                    .to_string();
                if event.is_error.unwrap_or(false) {
                    self.error_result = Some(if result_text.is_empty() {
                        "claude CLI reported an error result".to_string()
                    } else {
                        result_text
                    });
                    return None;
                }
                if self.emitted_text {
                    None
                } else {
                    self.emit(result_text)
                }
            }
            _ => None,
        }
    }

    fn emit(&mut self, text: String) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        let text = if self.emitted_text && (self.needs_separator || !self.partial_messages) {
            format!("\n{text}")
        } else {
            text
        };
        self.emitted_text = true;
        self.needs_separator = false;
        Some(text)
    }

    /// Final verdict once the process has exited.
    pub(crate) fn finish(&self, status: ExitStatus, stderr: &str) -> Result<Usage, BridgeError> {
        if !status.success() {
            let diagnostics = if !stderr.trim().is_empty() {
                truncate_str(stderr, STDERR_LIMIT_CHARS)
            } else if let Some(result) = &self.error_result {
                truncate_str(result, STDERR_LIMIT_CHARS)
            } else {
                "no diagnostic output".to_string()
            };
            return Err(BridgeError::CliFailed {
                code: status.code(),
                stderr: diagnostics,
            });
        }

        if let Some(result) = &self.error_result {
            return Err(BridgeError::CliFailed {
                code: None,
                stderr: truncate_str(result, STDERR_LIMIT_CHARS),
            });
        }

        if !self.saw_result {
            return Err(BridgeError::Truncated);
        }

        Ok(self.usage)
    }
}
