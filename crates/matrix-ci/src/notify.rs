//! Status-change notifications for jobs and the pipeline.
//!
//! Each sink carries a [`SinkRule`] deciding, per terminal status, whether
//! to deliver always, never, or only when the status differs from the last
//! one recorded for the same identity in the [`StatusStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use matrix_ci_state::{StatusKey, StatusRecord, StatusStore};

use crate::error::ConfigError;
use crate::job::{JobResult, JobState};
use crate::obs;
use crate::pipeline::PipelineResult;
use crate::step::CommandSpec;

const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;
const COMMAND_SINK_TIMEOUT: Duration = Duration::from_secs(30);

/// When a sink is told about a terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPolicy {
    Always,
    Never,
    /// Only when the status differs from the previous run's. The first run
    /// of an identity counts as a change.
    #[default]
    OnChange,
}

impl NotifyPolicy {
    pub fn should_notify(&self, previous: Option<&str>, current: &str) -> bool {
        match self {
            NotifyPolicy::Always => true,
            NotifyPolicy::Never => false,
            NotifyPolicy::OnChange => previous != Some(current),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Job,
    Pipeline,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Job => "job",
            NotificationKind::Pipeline => "pipeline",
        }
    }
}

/// Payload handed to sinks; serialized as JSON for webhook and command sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub run_id: String,
    /// Job identity key, or `pipeline`.
    pub key: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<usize>,
    pub status: String,
    #[serde(default)]
    pub previous_status: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_bundle: Option<PathBuf>,
    #[serde(default)]
    pub allow_failure: bool,
}

impl Notification {
    pub fn for_job(run_id: &str, result: &JobResult) -> Self {
        Self {
            kind: NotificationKind::Job,
            run_id: run_id.to_string(),
            key: result.job.key.to_string(),
            label: result.job.label.clone(),
            number: Some(result.job.number),
            status: result.state.as_str().to_string(),
            previous_status: None,
            duration_ms: result.duration_ms,
            log_bundle: result.log_bundle.clone(),
            allow_failure: result.job.allow_failure,
        }
    }

    pub fn for_pipeline(result: &PipelineResult) -> Self {
        Self {
            kind: NotificationKind::Pipeline,
            run_id: result.run_id.clone(),
            key: StatusKey::pipeline().to_string(),
            label: result.name.clone(),
            number: None,
            status: result.state.as_str().to_string(),
            previous_status: None,
            duration_ms: result.duration_ms,
            log_bundle: None,
            allow_failure: false,
        }
    }
}

/// Delivery failures. Logged by the notifier, never propagated.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification command failed: {0}")]
    Command(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode notification: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Destination for notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Emits a structured `tracing` event.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(
            event = "notify.status",
            kind = %n.kind.as_str(),
            key = %n.key,
            label = %n.label,
            status = %n.status,
            previous = ?n.previous_status,
            run_id = %n.run_id,
        );
        Ok(())
    }
}

/// POSTs the JSON payload to a URL.
pub struct WebhookSink {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .user_agent(concat!("matrix-ci/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            name: format!("webhook:{url}"),
            url,
            client,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(n)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Runs a local command with the JSON payload on stdin.
pub struct CommandSink {
    name: String,
    argv: Vec<String>,
    workdir: PathBuf,
}

impl CommandSink {
    pub fn new(run: &CommandSpec, workdir: impl Into<PathBuf>) -> Self {
        let argv = match run {
            CommandSpec::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
            CommandSpec::Argv(args) => args.clone(),
        };
        Self {
            name: format!("command:{run}"),
            argv,
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for CommandSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        let (exe, args) = self
            .argv
            .split_first()
            .ok_or_else(|| NotifyError::Command("empty command".to_string()))?;
        let payload = serde_json::to_vec(n)?;

        let mut child = Command::new(exe)
            .args(args)
            .current_dir(&self.workdir)
            .env("MATRIX_CI_NOTIFY_KIND", n.kind.as_str())
            .env("MATRIX_CI_NOTIFY_STATUS", &n.status)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // Commands that ignore stdin may exit before reading it.
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = tokio::time::timeout(COMMAND_SINK_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| NotifyError::Command("timed out".to_string()))??;
        if !output.status.success() {
            return Err(NotifyError::Command(format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Keeps every delivered notification in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that records the attempt and then reports a failure.
    pub fn failing() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(n.clone());
        }
        if self.fail {
            return Err(NotifyError::Command("recording sink set to fail".to_string()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// Which notifications a sink receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkRule {
    #[serde(default)]
    pub policy: NotifyPolicy,

    /// Overrides `policy` when the new status is `succeeded`.
    #[serde(default)]
    pub on_success: Option<NotifyPolicy>,

    /// Overrides `policy` when the new status is `failed`.
    #[serde(default)]
    pub on_failure: Option<NotifyPolicy>,

    /// Receive per-job notifications.
    #[serde(default = "default_true")]
    pub jobs: bool,

    /// Receive the pipeline-level notification.
    #[serde(default = "default_true")]
    pub pipeline: bool,
}

impl Default for SinkRule {
    fn default() -> Self {
        Self::new(NotifyPolicy::default())
    }
}

impl SinkRule {
    pub fn new(policy: NotifyPolicy) -> Self {
        Self {
            policy,
            on_success: None,
            on_failure: None,
            jobs: true,
            pipeline: true,
        }
    }

    pub fn on_success(mut self, policy: NotifyPolicy) -> Self {
        self.on_success = Some(policy);
        self
    }

    pub fn on_failure(mut self, policy: NotifyPolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    /// Policy in force for a given new status.
    pub fn policy_for(&self, status: &str) -> NotifyPolicy {
        let overridden = if status == JobState::Succeeded.as_str() {
            self.on_success
        } else if status == JobState::Failed.as_str() {
            self.on_failure
        } else {
            None
        };
        overridden.unwrap_or(self.policy)
    }

    pub fn accepts(&self, kind: NotificationKind) -> bool {
        match kind {
            NotificationKind::Job => self.jobs,
            NotificationKind::Pipeline => self.pipeline,
        }
    }

    pub fn should_notify(&self, kind: NotificationKind, previous: Option<&str>, status: &str) -> bool {
        self.accepts(kind) && self.policy_for(status).should_notify(previous, status)
    }
}

/// Transport of a configured sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkTransport {
    Log,
    Webhook {
        url: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Command {
        run: CommandSpec,
    },
}

/// A `[[notify]]` entry of the pipeline document.
///
/// ```toml
/// [[notify]]
/// type = "webhook"
/// url = "https://ci.example.com/hooks/matrix"
/// policy = "on_change"
/// on_failure = "always"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(flatten)]
    pub transport: SinkTransport,

    #[serde(flatten)]
    pub rule: SinkRule,
}

impl SinkConfig {
    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let invalid = |detail: String| ConfigError::InvalidSink { index, detail };
        match &self.transport {
            SinkTransport::Log => Ok(()),
            SinkTransport::Webhook { url, timeout_secs } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid(format!("webhook url '{url}' must be http(s)")));
                }
                if *timeout_secs == Some(0) {
                    return Err(invalid("timeout_secs must be greater than zero".to_string()));
                }
                Ok(())
            }
            SinkTransport::Command { run } => {
                if run.is_empty() {
                    return Err(invalid("command must not be empty".to_string()));
                }
                Ok(())
            }
        }
    }

    /// Instantiate the sink.
    pub fn build(
        &self,
        index: usize,
        workdir: &Path,
    ) -> Result<Arc<dyn NotificationSink>, ConfigError> {
        self.validate(index)?;
        let sink: Arc<dyn NotificationSink> = match &self.transport {
            SinkTransport::Log => Arc::new(LogSink),
            SinkTransport::Webhook { url, timeout_secs } => {
                let timeout =
                    Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_SECS));
                Arc::new(WebhookSink::new(url, timeout).map_err(|e| ConfigError::InvalidSink {
                    index,
                    detail: e.to_string(),
                })?)
            }
            SinkTransport::Command { run } => Arc::new(CommandSink::new(run, workdir)),
        };
        Ok(sink)
    }
}

/// One async lock per identity key, created on first use.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.to_string()).or_default().clone()
    }
}

/// Decides and delivers notifications for terminal transitions.
pub struct Notifier {
    store: Arc<dyn StatusStore>,
    sinks: Vec<(Arc<dyn NotificationSink>, SinkRule)>,
    locks: KeyedLocks,
}

impl Notifier {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store,
            sinks: Vec::new(),
            locks: KeyedLocks::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>, rule: SinkRule) -> Self {
        self.sinks.push((sink, rule));
        self
    }

    /// Build a notifier from `[[notify]]` entries.
    pub fn from_configs(
        store: Arc<dyn StatusStore>,
        configs: &[SinkConfig],
        workdir: &Path,
    ) -> Result<Self, ConfigError> {
        let mut notifier = Self::new(store);
        for (idx, config) in configs.iter().enumerate() {
            let sink = config.build(idx + 1, workdir)?;
            notifier = notifier.with_sink(sink, config.rule.clone());
        }
        Ok(notifier)
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Report a job that reached a terminal state. Returns deliveries made.
    pub async fn job_finished(&self, run_id: &str, result: &JobResult) -> usize {
        self.observe(Notification::for_job(run_id, result)).await
    }

    /// Report the finished pipeline. Returns deliveries made.
    pub async fn pipeline_finished(&self, result: &PipelineResult) -> usize {
        self.observe(Notification::for_pipeline(result)).await
    }

    /// Read previous status, decide per sink, deliver, record the new status.
    /// Serialized per identity key.
    ///
    /// A cancelled status is delivered to `always` sinks but is neither
    /// compared nor recorded, so an interrupted run does not register as a
    /// change for the next one.
    async fn observe(&self, mut notification: Notification) -> usize {
        let key = StatusKey::new(notification.key.clone());
        let lock = self.locks.lock_for(key.as_str());
        let _guard = lock.lock().await;

        let cancelled = notification.status == JobState::Cancelled.as_str();
        let previous = if cancelled {
            None
        } else {
            match self.store.get(&key).await {
                Ok(record) => record.map(|r| r.status),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read last status");
                    None
                }
            }
        };
        notification.previous_status = previous.clone();

        let mut delivered = 0;
        for (sink, rule) in &self.sinks {
            let wanted = if cancelled {
                rule.accepts(notification.kind)
                    && rule.policy_for(&notification.status) == NotifyPolicy::Always
            } else {
                rule.should_notify(notification.kind, previous.as_deref(), &notification.status)
            };
            if !wanted {
                continue;
            }
            match sink.deliver(&notification).await {
                Ok(()) => {
                    debug!(sink = %sink.name(), key = %key, status = %notification.status, "Delivered notification");
                    delivered += 1;
                }
                Err(e) => obs::notification_failed(sink.name(), key.as_str(), &e),
            }
        }

        if !cancelled {
            let record = StatusRecord::new(
                notification.status.clone(),
                notification.label.clone(),
                Some(notification.run_id.clone()),
            );
            if let Err(e) = self.store.put(&key, record).await {
                warn!(key = %key, error = %e, "Failed to record status");
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobSpec};
    use matrix_ci_state::fakes::MemoryStatusStore;

    fn result(state: JobState) -> JobResult {
        let job = Job::new(1, JobSpec::new().with_axis("os", "linux"), &["os".to_string()]);
        let mut r = JobResult::pending(job);
        r.state = state;
        r
    }

    fn notifier(rule: SinkRule) -> (Notifier, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let notifier = Notifier::new(Arc::new(MemoryStatusStore::new()))
            .with_sink(sink.clone(), rule);
        (notifier, sink)
    }

    #[test]
    fn test_policy_decisions() {
        assert!(NotifyPolicy::Always.should_notify(Some("failed"), "failed"));
        assert!(!NotifyPolicy::Never.should_notify(None, "failed"));
        assert!(NotifyPolicy::OnChange.should_notify(None, "succeeded"));
        assert!(!NotifyPolicy::OnChange.should_notify(Some("succeeded"), "succeeded"));
        assert!(NotifyPolicy::OnChange.should_notify(Some("succeeded"), "failed"));
    }

    #[test]
    fn test_overrides_pick_policy_by_status() {
        let rule = SinkRule::new(NotifyPolicy::OnChange)
            .on_failure(NotifyPolicy::Always)
            .on_success(NotifyPolicy::Never);
        assert_eq!(rule.policy_for("failed"), NotifyPolicy::Always);
        assert_eq!(rule.policy_for("succeeded"), NotifyPolicy::Never);
        assert_eq!(rule.policy_for("cancelled"), NotifyPolicy::OnChange);
    }

    #[tokio::test]
    async fn test_on_change_same_status_twice_notifies_once() {
        let (notifier, sink) = notifier(SinkRule::new(NotifyPolicy::OnChange));
        let r = result(JobState::Succeeded);

        assert_eq!(notifier.job_finished("run-1", &r).await, 1);
        assert_eq!(notifier.job_finished("run-2", &r).await, 0);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_on_change_status_flip_notifies_exactly_once() {
        let (notifier, sink) = notifier(SinkRule::new(NotifyPolicy::OnChange));
        notifier.job_finished("run-1", &result(JobState::Succeeded)).await;
        notifier.job_finished("run-2", &result(JobState::Failed)).await;
        notifier.job_finished("run-3", &result(JobState::Failed)).await;

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].status, "failed");
        assert_eq!(delivered[1].previous_status.as_deref(), Some("succeeded"));
        assert_eq!(delivered[1].run_id, "run-2");
    }

    #[tokio::test]
    async fn test_cancelled_is_not_recorded() {
        let (notifier, sink) = notifier(SinkRule::new(NotifyPolicy::OnChange));
        notifier.job_finished("run-1", &result(JobState::Succeeded)).await;
        assert_eq!(notifier.job_finished("run-2", &result(JobState::Cancelled)).await, 0);
        assert_eq!(notifier.job_finished("run-3", &result(JobState::Succeeded)).await, 0);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_contained() {
        let failing = Arc::new(RecordingSink::failing());
        let healthy = Arc::new(RecordingSink::new());
        let notifier = Notifier::new(Arc::new(MemoryStatusStore::new()))
            .with_sink(failing.clone(), SinkRule::new(NotifyPolicy::Always))
            .with_sink(healthy.clone(), SinkRule::new(NotifyPolicy::Always));

        let delivered = notifier.job_finished("run-1", &result(JobState::Failed)).await;
        assert_eq!(delivered, 1);
        assert_eq!(failing.len(), 1);
        assert_eq!(healthy.len(), 1);
    }

    #[tokio::test]
    async fn test_jobs_flag_filters_job_notifications() {
        let mut rule = SinkRule::new(NotifyPolicy::Always);
        rule.jobs = false;
        let (notifier, sink) = notifier(rule);
        notifier.job_finished("run-1", &result(JobState::Failed)).await;
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_command_sink_receives_payload_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("payload.json");
        let run = CommandSpec::shell(format!("cat > {}", out.display()));
        let sink = CommandSink::new(&run, dir.path());

        let n = Notification::for_job("run-9", &result(JobState::Failed));
        sink.deliver(&n).await.unwrap();

        let written: Notification =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written, n);
    }

    #[tokio::test]
    async fn test_command_sink_nonzero_exit_is_error() {
        let sink = CommandSink::new(&CommandSpec::shell("exit 4"), std::env::temp_dir());
        let n = Notification::for_job("run-9", &result(JobState::Failed));
        assert!(matches!(sink.deliver(&n).await, Err(NotifyError::Command(_))));
    }

    #[test]
    fn test_sink_config_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            notify: Vec<SinkConfig>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[notify]]
            type = "webhook"
            url = "https://ci.example.com/hook"
            on_failure = "always"

            [[notify]]
            type = "command"
            run = "notify-send matrix"
            policy = "always"
            pipeline = false

            [[notify]]
            type = "log"
            "#,
        )
        .unwrap();

        assert_eq!(doc.notify.len(), 3);
        assert_eq!(doc.notify[0].rule.policy, NotifyPolicy::OnChange);
        assert_eq!(doc.notify[0].rule.on_failure, Some(NotifyPolicy::Always));
        assert!(!doc.notify[1].rule.pipeline);
        assert_eq!(doc.notify[2].transport, SinkTransport::Log);
        for (idx, config) in doc.notify.iter().enumerate() {
            config.validate(idx + 1).unwrap();
        }
    }

    #[test]
    fn test_sink_config_rejects_bad_url() {
        let config = SinkConfig {
            transport: SinkTransport::Webhook {
                url: "ftp://nope".to_string(),
                timeout_secs: None,
            },
            rule: SinkRule::default(),
        };
        assert!(matches!(
            config.validate(2).unwrap_err(),
            ConfigError::InvalidSink { index: 2, .. }
        ));
    }
}
