//! Agent runner - spawns the agent process and streams its output
//!
//! Features:
//! - Prompt delivery over stdin or a named pipe
//! - Line-by-line stdout/stderr streaming into an [`EventSink`]
//! - Secret scrubbing of everything forwarded or captured
//! - Deadline with SIGTERM -> SIGKILL escalation
//! - Idempotent kill that closes the emission gate

use super::pipe::{write_prompt, PromptPipe, PROMPT_PATH_PLACEHOLDER};
use crate::log::{LogLine, LogSequencer, LogStream};
use crate::sink::{EventSink, StreamEvent};
use crate::task::StopSignal;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use relay_foundation::{Error, PromptDelivery, Result, RunnerConfig, SecretScrubber, TaskId};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long readers may keep draining after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Public types
// ============================================================================

/// Run phases, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    Spawning,
    WritingPrompt,
    Streaming,
    Exited,
}

/// Why the process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited(i32),
    Signaled(i32),
    /// Deadline expired
    TimedOut,
    /// Stopped through [`KillHandle::kill`]
    Killed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exited with code {}", code),
            ExitReason::Signaled(sig) => write!(f, "terminated by signal {}", sig),
            ExitReason::TimedOut => write!(f, "deadline exceeded"),
            ExitReason::Killed => write!(f, "killed"),
        }
    }
}

/// Result of one run. A non-zero exit is reported here, not as an error.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub reason: ExitReason,

    /// Last `stderr_tail_bytes` of stderr, scrubbed
    pub stderr: String,

    /// Records forwarded to the sink
    pub lines: u64,
}

impl RunOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self.reason {
            ExitReason::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.reason == ExitReason::Exited(0)
    }
}

/// What to run
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub task_id: TaskId,

    pub prompt: String,

    /// Explicit env on top of the allowlist (proxy placeholders, injected secrets)
    pub env: Vec<(String, String)>,

    /// Appended to the configured agent args
    pub extra_args: Vec<String>,

    pub working_dir: Option<PathBuf>,

    /// Overrides the configured deadline
    pub timeout: Option<Duration>,

    pub scrubber: SecretScrubber,
}

impl RunSpec {
    pub fn new(task_id: TaskId, prompt: impl Into<String>) -> Self {
        Self {
            task_id,
            prompt: prompt.into(),
            env: Vec::new(),
            extra_args: Vec::new(),
            working_dir: None,
            timeout: None,
            scrubber: SecretScrubber::default(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_scrubber(mut self, scrubber: SecretScrubber) -> Self {
        self.scrubber = scrubber;
        self
    }
}

// ============================================================================
// Emission gate
// ============================================================================

struct Gate {
    killed: bool,
    exited: bool,
    sink_open: bool,
    seq: LogSequencer,
    lines: u64,
}

/// State shared by readers, the supervisor and kill handles
struct Shared {
    task_id: TaskId,
    gate: Mutex<Gate>,
    sink: Arc<dyn EventSink>,
    scrubber: SecretScrubber,
    kill_requested: Notify,
}

impl Shared {
    /// Forward one line unless the gate is closed
    async fn emit(&self, stream: LogStream, raw: &str) {
        let mut gate = self.gate.lock().await;
        if gate.killed || !gate.sink_open {
            return;
        }

        let text = self.scrubber.scrub(raw);
        let line = match stream {
            LogStream::Stdout => LogLine::classify(&text),
            _ => LogLine::Text(text),
        };
        let record = gate.seq.next_record(stream, line);

        match self.sink.send(StreamEvent::Log(record)).await {
            Ok(()) => gate.lines += 1,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Sink closed, dropping further output");
                gate.sink_open = false;
            }
        }
    }
}

/// Stops one run; cheap to clone
#[derive(Clone)]
pub struct KillHandle {
    shared: Arc<Shared>,
}

impl KillHandle {
    /// Request a kill. Returns false if already killed or already exited.
    ///
    /// Once this returns no further events reach the sink.
    pub async fn kill(&self) -> bool {
        let mut gate = self.shared.gate.lock().await;
        if gate.killed || gate.exited {
            return false;
        }
        gate.killed = true;
        self.shared.kill_requested.notify_one();
        info!(task_id = %self.shared.task_id, "Kill requested");
        true
    }
}

#[async_trait]
impl StopSignal for KillHandle {
    async fn stop(&self) -> Result<bool> {
        Ok(self.kill().await)
    }
}

/// A spawned agent
pub struct RunningAgent {
    pid: u32,
    phase: watch::Receiver<RunPhase>,
    kill: KillHandle,
    join: JoinHandle<Result<RunOutcome>>,
}

impl RunningAgent {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// `pid:<n>`
    pub fn handle_id(&self) -> String {
        format!("pid:{}", self.pid)
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    pub async fn kill(&self) -> bool {
        self.kill.kill().await
    }

    /// Wait for exit and drained output
    pub async fn wait(self) -> Result<RunOutcome> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("runner supervisor failed: {}", e)))?
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Spawns agent processes from a [`RunnerConfig`]
#[derive(Debug, Clone)]
pub struct AgentRunner {
    config: RunnerConfig,
}

enum PromptSource {
    Stdin,
    Fifo { pipe: Arc<PromptPipe>, on_stdin: bool },
}

impl AgentRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Resolve the delivery strategy for a prompt of `len` bytes
    pub fn delivery_for(&self, len: usize) -> Result<PromptDelivery> {
        let limit = self.config.max_direct_prompt_bytes;
        match self.config.prompt_delivery {
            PromptDelivery::Direct if len > limit => Err(Error::validation(format!(
                "prompt is {} bytes; direct delivery is limited to {} bytes",
                len, limit
            ))),
            PromptDelivery::Direct => Ok(PromptDelivery::Direct),
            PromptDelivery::NamedPipe => Ok(PromptDelivery::NamedPipe),
            PromptDelivery::Auto if len > limit => Ok(PromptDelivery::NamedPipe),
            PromptDelivery::Auto => Ok(PromptDelivery::Direct),
        }
    }

    /// Spawn the agent; returns once the process exists
    pub async fn spawn(&self, spec: RunSpec, sink: Arc<dyn EventSink>) -> Result<RunningAgent> {
        let argv = self.config.agent_argv()?;
        let delivery = self.delivery_for(spec.prompt.len())?;

        let mut args: Vec<String> = argv[1..].to_vec();
        args.extend(spec.extra_args.iter().cloned());

        let source = match delivery {
            PromptDelivery::NamedPipe => {
                let pipe = Arc::new(PromptPipe::create()?);
                let path = pipe.path().to_string_lossy().into_owned();
                let mut referenced = false;
                for arg in args.iter_mut() {
                    if arg.contains(PROMPT_PATH_PLACEHOLDER) {
                        *arg = arg.replace(PROMPT_PATH_PLACEHOLDER, &path);
                        referenced = true;
                    }
                }
                PromptSource::Fifo {
                    pipe,
                    on_stdin: !referenced,
                }
            }
            _ => PromptSource::Stdin,
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&args)
            .env_clear()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        for key in &self.config.env_allowlist {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut fifo_sender = None;
        match &source {
            PromptSource::Stdin => {
                cmd.stdin(Stdio::piped());
            }
            PromptSource::Fifo {
                pipe,
                on_stdin: true,
            } => {
                let (fd, sender) = pipe.open_for_stdin()?;
                cmd.stdin(Stdio::from(fd));
                fifo_sender = Some(sender);
            }
            PromptSource::Fifo { .. } => {
                cmd.stdin(Stdio::null());
            }
        }

        let (phase_tx, phase_rx) = watch::channel(RunPhase::Spawning);
        debug!(task_id = %spec.task_id, program = %argv[0], delivery = ?delivery, "Spawning agent");

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Subprocess(format!("failed to spawn {}: {}", argv[0], e)))?;
        // releases our copy of the fifo read end
        drop(cmd);

        let pid = child
            .id()
            .ok_or_else(|| Error::Subprocess("agent exited before it could be tracked".into()))?;
        info!(task_id = %spec.task_id, pid, "Agent spawned");

        let shared = Arc::new(Shared {
            task_id: spec.task_id.clone(),
            gate: Mutex::new(Gate {
                killed: false,
                exited: false,
                sink_open: true,
                seq: LogSequencer::new(),
                lines: 0,
            }),
            sink,
            scrubber: spec.scrubber.clone(),
            kill_requested: Notify::new(),
        });

        let phase_tx = Arc::new(phase_tx);
        phase_tx.send_replace(RunPhase::WritingPrompt);

        // Prompt writer
        let prompt_task = {
            let shared = Arc::clone(&shared);
            let phase_tx = Arc::clone(&phase_tx);
            let prompt = spec.prompt.clone().into_bytes();
            let stdin = child.stdin.take();
            let pipe = match &source {
                PromptSource::Fifo { pipe, .. } => Some(Arc::clone(pipe)),
                PromptSource::Stdin => None,
            };
            tokio::spawn(async move {
                let result = match (stdin, fifo_sender, pipe) {
                    (Some(mut stdin), _, _) => async {
                        stdin.write_all(&prompt).await?;
                        stdin.shutdown().await?;
                        Ok::<(), std::io::Error>(())
                    }
                    .await
                    .map_err(|e| Error::Subprocess(format!("write prompt to stdin: {}", e))),
                    (None, Some(sender), _) => write_prompt(sender, &prompt).await,
                    (None, None, Some(pipe)) => match pipe.open_sender_when_ready().await {
                        Ok(sender) => write_prompt(sender, &prompt).await,
                        Err(e) => Err(e),
                    },
                    (None, None, None) => Err(Error::Internal("no prompt channel".into())),
                };

                if let Err(e) = result {
                    warn!(task_id = %shared.task_id, error = %e, "Prompt delivery failed");
                    shared
                        .emit(LogStream::System, &format!("prompt delivery failed: {}", e))
                        .await;
                }
                phase_tx.send_if_modified(|phase| {
                    if *phase == RunPhase::WritingPrompt {
                        *phase = RunPhase::Streaming;
                        true
                    } else {
                        false
                    }
                });
            })
        };

        // Output readers
        let stdout_task = child.stdout.take().map(|stdout| {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                while let Some(line) = next_line(&mut reader, &mut buf).await {
                    shared.emit(LogStream::Stdout, &line).await;
                }
            })
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            let shared = Arc::clone(&shared);
            let limit = self.config.stderr_tail_bytes;
            tokio::spawn(async move {
                let mut tail = StderrTail::new(limit);
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Some(line) = next_line(&mut reader, &mut buf).await {
                    tail.push(&shared.scrubber.scrub(&line));
                    shared.emit(LogStream::Stderr, &line).await;
                }
                tail.into_string()
            })
        });

        let supervisor = Supervisor {
            shared: Arc::clone(&shared),
            pid,
            timeout: spec
                .timeout
                .unwrap_or(Duration::from_secs(self.config.timeout_secs)),
            grace: Duration::from_secs(self.config.grace_secs),
        };

        let join = tokio::spawn(async move {
            let result = supervisor
                .run(&mut child, prompt_task, stdout_task, stderr_task)
                .await;
            phase_tx.send_replace(RunPhase::Exited);
            // the fifo dir goes away with the last reference here
            drop(source);
            result
        });

        Ok(RunningAgent {
            pid,
            phase: phase_rx,
            kill: KillHandle { shared },
            join,
        })
    }
}

// ============================================================================
// Supervisor
// ============================================================================

struct Supervisor {
    shared: Arc<Shared>,
    pid: u32,
    timeout: Duration,
    grace: Duration,
}

impl Supervisor {
    async fn run(
        self,
        child: &mut Child,
        prompt_task: JoinHandle<()>,
        stdout_task: Option<JoinHandle<()>>,
        stderr_task: Option<JoinHandle<String>>,
    ) -> Result<RunOutcome> {
        let task_id = self.shared.task_id.clone();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let grace_timer = tokio::time::sleep(Duration::from_secs(365 * 24 * 3600));
        tokio::pin!(grace_timer);

        let mut timed_out = false;
        let mut term_sent = false;
        let mut kill_sent = false;
        let mut cancelled = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut deadline, if !term_sent && !kill_sent => {
                    warn!(task_id = %task_id, timeout_secs = self.timeout.as_secs(), "Deadline exceeded, sending SIGTERM");
                    timed_out = true;
                    term_sent = true;
                    self.shared
                        .emit(LogStream::System, "deadline exceeded, sending SIGTERM")
                        .await;
                    signal_group(self.pid, Signal::SIGTERM);
                    grace_timer.as_mut().reset(Instant::now() + self.grace);
                }
                _ = &mut grace_timer, if term_sent && !kill_sent => {
                    warn!(task_id = %task_id, "Grace period expired, sending SIGKILL");
                    kill_sent = true;
                    force_kill(child, self.pid);
                }
                _ = self.shared.kill_requested.notified(), if !kill_sent => {
                    cancelled = true;
                    kill_sent = true;
                    force_kill(child, self.pid);
                }
            }
        };

        {
            let mut gate = self.shared.gate.lock().await;
            gate.exited = true;
            // a kill that raced the exit still wins
            cancelled |= gate.killed;
        }
        prompt_task.abort();

        let status =
            status.map_err(|e| Error::Subprocess(format!("waiting for agent failed: {}", e)))?;

        if let Some(handle) = stdout_task {
            drain(handle, &task_id).await;
        }
        let stderr = match stderr_task {
            Some(handle) => drain(handle, &task_id).await.unwrap_or_default(),
            None => String::new(),
        };

        let reason = if cancelled {
            ExitReason::Killed
        } else if timed_out {
            ExitReason::TimedOut
        } else if let Some(code) = status.code() {
            ExitReason::Exited(code)
        } else {
            ExitReason::Signaled(status.signal().unwrap_or_default())
        };

        let lines = self.shared.gate.lock().await.lines;
        info!(task_id = %task_id, reason = %reason, lines, "Agent finished");

        Ok(RunOutcome {
            reason,
            stderr,
            lines,
        })
    }
}

async fn drain<T>(mut handle: JoinHandle<T>, task_id: &TaskId) -> Option<T> {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(task_id = %task_id, error = %e, "Output reader failed");
            None
        }
        Err(_) => {
            debug!(task_id = %task_id, "Output still open after exit, detaching reader");
            handle.abort();
            None
        }
    }
}

/// Signal the agent's process group; a vanished group is not an error
fn signal_group(pid: u32, signal: Signal) {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = ?signal, error = %e, "Failed to signal process group"),
    }
}

fn force_kill(child: &mut Child, pid: u32) {
    signal_group(pid, Signal::SIGKILL);
    if let Err(e) = child.start_kill() {
        debug!(pid, error = %e, "start_kill after group kill");
    }
}

/// Next line without the trailing newline; invalid UTF-8 is replaced
async fn next_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
) -> Option<String> {
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }
            Some(String::from_utf8_lossy(buf).into_owned())
        }
    }
}

/// Bounded tail of stderr
struct StderrTail {
    buf: String,
    limit: usize,
}

impl StderrTail {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
        }
    }

    fn push(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.limit {
            let mut cut = self.buf.len() - self.limit;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    fn into_string(self) -> String {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(command: &str) -> AgentRunner {
        AgentRunner::new(RunnerConfig {
            agent_command: command.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_delivery_selection() {
        let auto = runner("cat");
        assert_eq!(auto.delivery_for(10).unwrap(), PromptDelivery::Direct);
        assert_eq!(
            auto.delivery_for(64 * 1024 + 1).unwrap(),
            PromptDelivery::NamedPipe
        );

        let direct = AgentRunner::new(RunnerConfig {
            prompt_delivery: PromptDelivery::Direct,
            ..Default::default()
        });
        assert!(matches!(
            direct.delivery_for(64 * 1024 + 1),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let mut tail = StderrTail::new(8);
        tail.push("aaaa");
        tail.push("bbbb");
        tail.push("cc");
        let out = tail.into_string();
        assert!(out.len() <= 8);
        assert!(out.ends_with("cc\n"));
    }

    #[test]
    fn test_stderr_tail_respects_char_boundaries() {
        let mut tail = StderrTail::new(5);
        tail.push("한글한글");
        let out = tail.into_string();
        assert!(out.len() <= 6);
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(ExitReason::Exited(2).to_string(), "exited with code 2");
        assert_eq!(ExitReason::TimedOut.to_string(), "deadline exceeded");
    }
}
