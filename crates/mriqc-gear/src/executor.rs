//! Tool execution with streamed output, deadline and cancellation.

use std::collections::VecDeque;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::ToolInvocation;
use crate::error::{GearError, Result};
use crate::telemetry::TOOL_OUTPUT_TARGET;

/// Lines of tool output retained in an [`ExecutionResult`].
pub const DEFAULT_MAX_LOG_LINES: usize = 200;

/// Time between SIGTERM and SIGKILL when terminating the tool.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How long to wait for output readers after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a run ended without a normal exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interruption {
    Cancelled,
    TimedOut,
    Signaled(i32),
}

/// Result of running the tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Exit code (0 = success, -1 when the process produced none).
    pub exit_code: i32,

    pub duration: Duration,

    pub started_at: DateTime<Utc>,

    /// Tail of the combined stdout/stderr stream.
    pub log_lines: Vec<String>,

    /// Whether this was a dry run (no process launched).
    pub dry_run: bool,

    pub interruption: Option<Interruption>,
}

impl ExecutionResult {
    /// Synthetic zero-exit result for a dry run.
    pub fn dry_run() -> Self {
        Self {
            exit_code: 0,
            duration: Duration::ZERO,
            started_at: Utc::now(),
            log_lines: Vec::new(),
            dry_run: true,
            interruption: None,
        }
    }

    /// Result for a launch skipped because cancellation was already requested.
    pub fn cancelled_before_start() -> Self {
        Self {
            exit_code: -1,
            duration: Duration::ZERO,
            started_at: Utc::now(),
            log_lines: Vec::new(),
            dry_run: false,
            interruption: Some(Interruption::Cancelled),
        }
    }

    /// Result for a tool that could not be started at all.
    pub fn launch_failure(reason: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            duration: Duration::ZERO,
            started_at: Utc::now(),
            log_lines: vec![reason.into()],
            dry_run: false,
            interruption: None,
        }
    }

    /// Whether the tool exited 0 without interruption.
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && self.interruption.is_none()
    }
}

/// Something that can run a [`ToolInvocation`].
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation, dry_run: bool) -> Result<ExecutionResult>;

    /// Whether cancellation has been requested; nothing new should start.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Handle used to stop the run from outside the pipeline.
///
/// Cancellation is sticky: once requested, every later wait on the handle
/// completes immediately.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Subprocess runner for the wrapped tool.
#[derive(Debug, Clone)]
pub struct Executor {
    timeout: Option<Duration>,
    grace_period: Duration,
    max_log_lines: usize,
    cancel: CancelHandle,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            timeout: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            cancel: CancelHandle::new(),
        }
    }

    /// Terminate the tool once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_max_log_lines(mut self, max: usize) -> Self {
        self.max_log_lines = max;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    async fn execute(&self, invocation: &ToolInvocation) -> Result<ExecutionResult> {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut std_cmd = std::process::Command::new(invocation.program());
        std_cmd
            .args(invocation.args())
            .current_dir(invocation.working_dir())
            .envs(invocation.env().iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own process group, so termination reaches every descendant
            .process_group(0);
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| GearError::Launch {
            program: invocation.program().to_string(),
            reason: e.to_string(),
        })?;
        info!(pid = ?child.id(), program = %invocation.program(), "Tool started");

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.max_log_lines)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(drain(stdout, false, tail.clone(), self.max_log_lines));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(drain(stderr, true, tail.clone(), self.max_log_lines));
        }

        let deadline = async {
            match self.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut interruption = None;
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = deadline => {
                warn!(timeout = ?self.timeout, "Tool exceeded its deadline, terminating");
                interruption = Some(Interruption::TimedOut);
                None
            }
            _ = self.cancel.cancelled() => {
                warn!("Cancellation requested, terminating tool");
                interruption = Some(Interruption::Cancelled);
                None
            }
        };

        let status = match status {
            Some(status) => Some(status),
            None => self.terminate_group(&mut child).await,
        };

        for reader in readers {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("Output reader did not finish after process exit");
            }
        }

        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        if interruption.is_none() {
            if let Some(signal) = status.and_then(|s| s.signal()) {
                interruption = Some(Interruption::Signaled(signal));
            }
        }

        let log_lines = tail
            .lock()
            .map(|t| t.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        let result = ExecutionResult {
            exit_code,
            duration: start.elapsed(),
            started_at,
            log_lines,
            dry_run: false,
            interruption,
        };
        info!(
            exit_code = result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            interruption = ?result.interruption,
            "Tool finished"
        );
        Ok(result)
    }

    /// SIGTERM the whole process group, then SIGKILL after the grace period.
    async fn terminate_group(&self, child: &mut Child) -> Option<ExitStatus> {
        let Some(pid) = child.id() else {
            return child.wait().await.ok();
        };
        let pgid = Pid::from_raw(pid as i32);

        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            warn!(pgid = pid, error = %e, "Failed to send SIGTERM to process group");
        }

        let status = match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        };

        // stragglers in the group, and a leader that ignored SIGTERM
        let _ = killpg(pgid, Signal::SIGKILL);

        match status {
            Some(status) => Some(status),
            None => child.wait().await.ok(),
        }
    }
}

#[async_trait]
impl ToolRunner for Executor {
    async fn run(&self, invocation: &ToolInvocation, dry_run: bool) -> Result<ExecutionResult> {
        if dry_run {
            info!(command = %invocation, "Dry run: command was NOT run");
            return Ok(ExecutionResult::dry_run());
        }
        if self.is_cancelled() {
            warn!(command = %invocation, "Cancellation pending, command was NOT run");
            return Ok(ExecutionResult::cancelled_before_start());
        }
        self.execute(invocation).await
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn drain<R>(
    reader: R,
    is_stderr: bool,
    tail: Arc<Mutex<VecDeque<String>>>,
    max_lines: usize,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if is_stderr {
                        warn!(target: TOOL_OUTPUT_TARGET, "{}", line);
                    } else {
                        info!(target: TOOL_OUTPUT_TARGET, "{}", line);
                    }
                    if max_lines == 0 {
                        continue;
                    }
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == max_lines {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Stopped reading tool output");
                    break;
                }
            }
        }
    })
}
