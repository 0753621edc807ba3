//! Step execution: spawn, capture, time out, cancel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::resolve::ResolvedStep;
use crate::step::StepCategory;

/// How long to wait for output pipes to close once the child is gone.
/// Grandchildren that inherited the pipes can keep them open; whatever was
/// read by then is kept.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Terminal status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    /// Non-zero exit or killed by a signal.
    Failed,
    /// Exceeded its timeout and was killed.
    TimedOut,
    /// The executable could not be started.
    SpawnError,
    Cancelled,
    /// Not run because an earlier step halted the job.
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::TimedOut => "timed_out",
            StepStatus::SpawnError => "spawn_error",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Counts as a step failure. Cancellation and skipping do not.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StepStatus::Failed | StepStatus::TimedOut | StepStatus::SpawnError
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub category: StepCategory,
    pub status: StepStatus,

    /// Process exit code, when the process exited normally.
    pub exit_code: Option<i32>,

    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Copied from the step: a failure here does not fail the job.
    pub allow_failure: bool,

    /// Spawn error or timeout description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    fn blank(step: &ResolvedStep, status: StepStatus) -> Self {
        Self {
            step_name: step.name.clone(),
            category: step.category,
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at: Utc::now(),
            duration_ms: 0,
            allow_failure: step.allow_failure,
            error: None,
        }
    }

    /// Step that never ran because the job was halted.
    pub fn skipped(step: &ResolvedStep) -> Self {
        Self::blank(step, StepStatus::Skipped)
    }

    /// Step that never ran because the run was cancelled.
    pub fn cancelled(step: &ResolvedStep) -> Self {
        Self::blank(step, StepStatus::Cancelled)
    }

    /// Whether this step passed.
    pub fn passed(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// Failure that counts against the job.
    pub fn is_blocking_failure(&self) -> bool {
        self.status.is_failure() && !self.allow_failure
    }
}

/// Process environment shared by every step of one job.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(workdir: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            workdir: workdir.into(),
            env: Vec::new(),
            cancel,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

enum Outcome {
    Exited(ExitStatus),
    WaitError(std::io::Error),
    TimedOut,
    Cancelled,
}

/// Executes resolved steps as child processes.
pub struct StepRunner;

impl StepRunner {
    /// Run one step to completion, timeout or cancellation.
    ///
    /// Never errors: spawn failures and timeouts are reported through the
    /// returned status. `extra_env` is applied after the context and step
    /// environment.
    pub async fn execute_step(
        step: &ResolvedStep,
        ctx: &StepContext,
        extra_env: &[(String, String)],
    ) -> StepResult {
        if ctx.cancel.is_cancelled() {
            return StepResult::cancelled(step);
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let mut result = StepResult::blank(step, StepStatus::Failed);
        result.started_at = started_at;

        let Some((exe, args)) = step.argv.split_first() else {
            result.status = StepStatus::SpawnError;
            result.error = Some("empty command".to_string());
            return result;
        };

        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(&ctx.workdir)
            .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(step.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(step = %step.name, exe = %exe, error = %e, "Failed to spawn step");
                result.status = StepStatus::SpawnError;
                result.error = Some(format!("failed to spawn '{exe}': {e}"));
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };

        let stdout = child.stdout.take().map(OutputCapture::spawn);
        let stderr = child.stderr.take().map(OutputCapture::spawn);

        let limit = Duration::from_secs(step.timeout_secs);
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => Outcome::Cancelled,
            waited = tokio::time::timeout(limit, child.wait()) => match waited {
                Ok(Ok(status)) => Outcome::Exited(status),
                Ok(Err(e)) => Outcome::WaitError(e),
                Err(_) => Outcome::TimedOut,
            },
        };

        if matches!(outcome, Outcome::TimedOut | Outcome::Cancelled) {
            if let Err(e) = child.kill().await {
                debug!(step = %step.name, error = %e, "Kill after timeout/cancel failed");
            }
        }

        let (stdout, stderr) = tokio::join!(collect(stdout), collect(stderr));
        result.stdout = stdout;
        result.stderr = stderr;
        result.duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Exited(status) => {
                result.exit_code = status.code();
                result.status = if status.success() {
                    StepStatus::Succeeded
                } else {
                    StepStatus::Failed
                };
            }
            Outcome::WaitError(e) => {
                result.status = StepStatus::Failed;
                result.error = Some(format!("failed waiting on child: {e}"));
            }
            Outcome::TimedOut => {
                result.status = StepStatus::TimedOut;
                result.error = Some(format!(
                    "timed out after {} seconds",
                    step.timeout_secs
                ));
            }
            Outcome::Cancelled => {
                result.status = StepStatus::Cancelled;
            }
        }

        debug!(
            step = %step.name,
            status = %result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "Step finished"
        );
        result
    }
}

/// Output read so far from one pipe. Shared with the drain task so an
/// aborted drain still leaves everything it read.
type OutputBuffer = Arc<Mutex<Vec<u8>>>;

struct OutputCapture {
    buffer: OutputBuffer,
    task: JoinHandle<()>,
}

impl OutputCapture {
    fn spawn<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = OutputBuffer::default();
        let task = tokio::spawn(drain(reader, buffer.clone()));
        Self { buffer, task }
    }

    async fn finish(mut self) -> String {
        if tokio::time::timeout(OUTPUT_GRACE, &mut self.task).await.is_err() {
            debug!("Output pipe still open after grace period, keeping partial output");
            self.task.abort();
        }
        let bytes = match self.buffer.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, buffer: OutputBuffer) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => match buffer.lock() {
                Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
            },
        }
    }
}

async fn collect(capture: Option<OutputCapture>) -> String {
    match capture {
        Some(capture) => capture.finish().await,
        None => String::new(),
    }
}
