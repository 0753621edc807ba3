//! Pipeline orchestration: expand, run jobs on a bounded pool, gate, notify.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::artifacts::ArtifactLayout;
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError, Result};
use crate::executor::JobExecutor;
use crate::gate::PipelineGate;
use crate::job::{JobResult, JobState};
use crate::notify::Notifier;
use crate::obs;
use crate::resolve::JobPlan;

/// Process exit codes.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const JOB_FAILURE: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const INTERNAL_ERROR: i32 = 3;
    pub const CANCELLED: i32 = 130;
}

/// Overall pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "pending",
            PipelineState::Running => "running",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
            PipelineState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Succeeded | PipelineState::Failed | PipelineState::Cancelled
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a complete pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,
    pub name: String,
    pub state: PipelineState,

    /// Job results in expansion order.
    pub jobs: Vec<JobResult>,

    /// Why the pipeline failed (empty if it passed).
    #[serde(default)]
    pub violations: Vec<String>,

    /// Failures of jobs allowed to fail.
    #[serde(default)]
    pub tolerated: Vec<String>,

    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn passed_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Succeeded)
            .count()
    }

    /// Jobs that failed, including those allowed to fail.
    pub fn failed_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Failed)
            .count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Cancelled)
            .count()
    }

    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Succeeded
    }

    pub fn exit_code(&self) -> i32 {
        match self.state {
            PipelineState::Succeeded => exit_code::SUCCESS,
            PipelineState::Failed => exit_code::JOB_FAILURE,
            PipelineState::Cancelled => exit_code::CANCELLED,
            PipelineState::Pending | PipelineState::Running => exit_code::INTERNAL_ERROR,
        }
    }
}

/// Owns a pipeline run from expansion to final status.
pub struct PipelineController {
    config: PipelineConfig,
    notifier: Arc<Notifier>,
    cancel: CancellationToken,
    only: Option<Vec<usize>>,
}

impl PipelineController {
    /// Validates the configuration; nothing has run yet.
    pub fn new(config: PipelineConfig, notifier: Notifier) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            notifier: Arc::new(notifier),
            cancel: CancellationToken::new(),
            only: None,
        })
    }

    /// Token that cancels the whole run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Restrict the run to the given job numbers.
    pub fn with_job_filter(mut self, numbers: Vec<usize>) -> Self {
        self.only = Some(numbers);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Expand and resolve every selected job. Any configuration problem is
    /// reported here, before a single subprocess starts.
    pub fn plan(&self) -> std::result::Result<Vec<JobPlan>, ConfigError> {
        let mut jobs = self.config.expand()?;
        if let Some(only) = &self.only {
            if let Some(missing) = only.iter().find(|n| !jobs.iter().any(|j| j.number == **n)) {
                return Err(ConfigError::InvalidSetting {
                    field: "only".to_string(),
                    detail: format!("no job #{missing} (matrix has {} jobs)", jobs.len()),
                });
            }
            jobs.retain(|j| only.contains(&j.number));
        }

        let resolver = self.config.resolver();
        jobs.iter().map(|job| resolver.resolve(job)).collect()
    }

    /// Run every job and return the final result.
    ///
    /// Job failures, including a job's own artifact errors, are reported
    /// through the result. `Err` means the run itself could not proceed:
    /// configuration, a panicked job task or an unwritable `pipeline.json`.
    pub async fn run(&self) -> Result<PipelineResult> {
        let start = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let plans = self.plan()?;
        let settings = &self.config.settings;
        let max_parallel = settings.effective_max_parallel();

        obs::pipeline_started(&run_id, &settings.name, plans.len(), max_parallel);

        let layout = ArtifactLayout::new(&settings.artifacts_dir);
        let executor = Arc::new(JobExecutor::new(
            run_id.clone(),
            settings.effective_workdir(),
            layout.clone(),
            self.cancel.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let total = plans.len();
        let mut set = JoinSet::new();

        for (idx, plan) in plans.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let executor = executor.clone();
            let notifier = self.notifier.clone();
            let cancel = self.cancel.clone();
            let run_id = run_id.clone();

            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) if !cancel.is_cancelled() => executor.run(plan).await,
                    _ => {
                        info!(job = plan.job.number, label = %plan.job.label, "Job cancelled before start");
                        JobResult::cancelled_before_start(plan.job)
                    }
                };
                notifier.job_finished(&run_id, &result).await;
                (idx, result)
            });
        }

        let mut slots: Vec<Option<JobResult>> = (0..total).map(|_| None).collect();
        let mut failure: Option<PipelineError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => {
                    error!(error = %e, "Job task failed; cancelling run");
                    self.cancel.cancel();
                    failure.get_or_insert(PipelineError::Join(e.to_string()));
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let jobs: Vec<JobResult> = slots.into_iter().flatten().collect();
        let verdict = PipelineGate::evaluate(&jobs, self.cancel.is_cancelled());
        let result = PipelineResult {
            run_id,
            name: settings.name.clone(),
            state: verdict.state,
            jobs,
            violations: verdict.violations,
            tolerated: verdict.tolerated,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        layout.write_pipeline(&result)?;
        self.notifier.pipeline_finished(&result).await;
        obs::pipeline_finished(
            &result.run_id,
            result.state.as_str(),
            result.failed_count(),
            result.duration_ms,
        );
        Ok(result)
    }
}
