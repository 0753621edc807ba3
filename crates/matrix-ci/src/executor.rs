//! Per-job execution: phases in order, fail-fast, coverage merge, post steps.

use chrono::Utc;
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::artifacts::{ArtifactLayout, JobArtifacts};
use crate::coverage::CoverageAggregator;
use crate::error::PipelineError;
use crate::job::{JobResult, JobState};
use crate::obs;
use crate::resolve::{JobPlan, ResolvedStep};
use crate::runner::{StepContext, StepResult, StepRunner, StepStatus};
use crate::step::StepCategory;

/// Phases before post-processing, with the state a job is in while running them.
const PHASES: [(StepCategory, JobState); 3] = [
    (StepCategory::Provision, JobState::Provisioning),
    (StepCategory::Build, JobState::Building),
    (StepCategory::Test, JobState::Testing),
];

/// Runs one job's plan. The executor is the only writer of its `JobResult`.
pub struct JobExecutor {
    run_id: String,
    workdir: PathBuf,
    layout: ArtifactLayout,
    cancel: CancellationToken,
}

impl JobExecutor {
    pub fn new(
        run_id: impl Into<String>,
        workdir: impl Into<PathBuf>,
        layout: ArtifactLayout,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workdir: workdir.into(),
            layout,
            cancel,
        }
    }

    /// Execute the plan to a terminal state.
    ///
    /// Never errors: step failures and artifact I/O errors are both recorded
    /// in the returned result, so one job cannot abort its siblings.
    pub async fn run(&self, plan: JobPlan) -> JobResult {
        let span = obs::job_span(&self.run_id, &plan.job);
        self.run_plan(plan).instrument(span).await
    }

    async fn run_plan(&self, plan: JobPlan) -> JobResult {
        let start = Instant::now();
        let job = plan.job.clone();
        let mut result = JobResult::pending(job.clone());
        result.started_at = Utc::now();

        let artifacts = match self.layout.prepare_job(&job) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                record_job_error(&mut result, &e);
                result.duration_ms = start.elapsed().as_millis() as u64;
                obs::job_finished(&job, result.state, result.duration_ms);
                return result;
            }
        };
        let ctx = self.context(&plan, &artifacts);

        let mut halted = false;
        let mut coverage_inputs = Vec::new();

        for (category, state) in PHASES {
            let steps: Vec<&ResolvedStep> = plan.category(category).collect();
            if steps.is_empty() {
                continue;
            }
            if !halted && !self.cancel.is_cancelled() {
                result.state = state;
                obs::job_state(&job, state);
            }

            for step in steps {
                if self.cancel.is_cancelled() {
                    result.steps.push(StepResult::cancelled(step));
                    continue;
                }
                if halted {
                    debug!(step = %step.name, "Skipping step after earlier failure");
                    result.steps.push(StepResult::skipped(step));
                    continue;
                }

                let mut extra = vec![("MATRIX_CI_STEP".to_string(), step.name.clone())];
                if let Some(selector) = &step.selector {
                    extra.push(("MATRIX_CI_TEST_SELECTOR".to_string(), selector.clone()));
                }
                let coverage_file = step
                    .coverage_file
                    .as_ref()
                    .map(|file| artifacts.coverage_path(file));
                if let Some(path) = &coverage_file {
                    extra.push((
                        "MATRIX_CI_COVERAGE_FILE".to_string(),
                        path.display().to_string(),
                    ));
                }

                let step_result = StepRunner::execute_step(step, &ctx, &extra).await;
                obs::step_finished(&step_result);

                if let Some(path) = coverage_file {
                    if step_result.status != StepStatus::Cancelled {
                        coverage_inputs.push(path);
                    }
                }
                if step.fail_fast && step_result.is_blocking_failure() {
                    halted = true;
                }
                result.steps.push(step_result);
            }
        }

        if !coverage_inputs.is_empty() {
            if let Some(summary) =
                CoverageAggregator::aggregate(&coverage_inputs, &artifacts.merged_coverage)
            {
                debug!(
                    inputs = summary.inputs_merged,
                    skipped = summary.inputs_skipped,
                    files = summary.files,
                    "Merged coverage"
                );
                result.coverage = Some(summary.output);
            }
        }

        self.run_post(&plan, &ctx, &mut result).await;

        result.state = final_state(&result.steps);
        result.duration_ms = start.elapsed().as_millis() as u64;
        match artifacts.write_log_bundle(&job, &result.steps) {
            Ok(path) => result.log_bundle = Some(path),
            Err(e) => record_job_error(&mut result, &e),
        }
        if let Err(e) = artifacts.write_result(&result) {
            record_job_error(&mut result, &e);
        }

        obs::job_finished(&job, result.state, result.duration_ms);
        result
    }

    /// Post steps run after any failure, each independently. Not started
    /// once cancellation is requested.
    async fn run_post(&self, plan: &JobPlan, ctx: &StepContext, result: &mut JobResult) {
        let steps: Vec<&ResolvedStep> = plan.category(StepCategory::Post).collect();
        if steps.is_empty() {
            return;
        }
        if !self.cancel.is_cancelled() {
            result.state = JobState::PostProcessing;
            obs::job_state(&plan.job, JobState::PostProcessing);
        }

        let status_so_far = if result.steps.iter().any(StepResult::is_blocking_failure) {
            JobState::Failed
        } else {
            JobState::Succeeded
        };
        let mut extra = vec![(
            "MATRIX_CI_JOB_STATUS".to_string(),
            status_so_far.as_str().to_string(),
        )];
        if let Some(report) = &result.coverage {
            extra.push((
                "MATRIX_CI_COVERAGE_REPORT".to_string(),
                report.display().to_string(),
            ));
        }

        for step in steps {
            if self.cancel.is_cancelled() {
                result.steps.push(StepResult::cancelled(step));
                continue;
            }
            let mut step_env = extra.clone();
            step_env.push(("MATRIX_CI_STEP".to_string(), step.name.clone()));
            let step_result = StepRunner::execute_step(step, ctx, &step_env).await;
            obs::step_finished(&step_result);
            result.steps.push(step_result);
        }
    }

    fn context(&self, plan: &JobPlan, artifacts: &JobArtifacts) -> StepContext {
        let job = &plan.job;
        let mut ctx = StepContext::new(&self.workdir, self.cancel.clone())
            .with_env("MATRIX_CI_RUN_ID", &self.run_id)
            .with_env("MATRIX_CI_JOB_ID", job.key.as_str())
            .with_env("MATRIX_CI_JOB_NUMBER", job.number.to_string())
            .with_env("MATRIX_CI_JOB_LABEL", &job.label)
            .with_env("MATRIX_CI_ARTIFACTS_DIR", artifacts.dir.display().to_string());
        ctx.env.extend(job.spec.env_vars());
        ctx
    }
}

/// Attach a job-level error. The job fails unless it was already cancelled.
fn record_job_error(result: &mut JobResult, error: &PipelineError) {
    warn!(job = result.job.number, error = %error, "Job artifact error");
    if result.state != JobState::Cancelled {
        result.state = JobState::Failed;
    }
    result.error = Some(error.to_string());
}

/// Cancelled if any step was cancelled, failed on any blocking failure,
/// otherwise succeeded.
fn final_state(steps: &[StepResult]) -> JobState {
    if steps.iter().any(|s| s.status == StepStatus::Cancelled) {
        JobState::Cancelled
    } else if steps.iter().any(StepResult::is_blocking_failure) {
        JobState::Failed
    } else {
        JobState::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobSpec};

    fn step(name: &str, category: StepCategory, line: &str) -> ResolvedStep {
        ResolvedStep {
            name: name.to_string(),
            category,
            argv: vec!["sh".to_string(), "-c".to_string(), line.to_string()],
            timeout_secs: 30,
            fail_fast: true,
            allow_failure: false,
            selector: None,
            coverage_file: None,
            env: Vec::new(),
        }
    }

    fn plan(steps: Vec<ResolvedStep>) -> JobPlan {
        JobPlan {
            job: Job::new(1, JobSpec::new().with_axis("os", "linux"), &["os".to_string()]),
            steps,
        }
    }

    fn executor(dir: &std::path::Path) -> JobExecutor {
        JobExecutor::new(
            "run-test",
            dir,
            ArtifactLayout::new(dir.join("artifacts")),
            CancellationToken::new(),
        )
    }

    fn statuses(result: &JobResult) -> Vec<(&str, StepStatus)> {
        result
            .steps
            .iter()
            .map(|s| (s.step_name.as_str(), s.status))
            .collect()
    }

    #[tokio::test]
    async fn test_all_steps_pass() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(dir.path())
            .run(plan(vec![
                step("deps", StepCategory::Provision, "true"),
                step("build", StepCategory::Build, "echo built"),
                step("test", StepCategory::Test, "test \"$AXIS_OS\" = linux"),
                step("post", StepCategory::Post, "test \"$MATRIX_CI_JOB_STATUS\" = succeeded"),
            ]))
            .await;

        assert_eq!(result.state, JobState::Succeeded);
        assert_eq!(result.passed_count(), 4);
        let log = std::fs::read_to_string(result.log_bundle.unwrap()).unwrap();
        assert!(log.contains("built"));
    }

    #[tokio::test]
    async fn test_fail_fast_skips_rest_but_runs_post() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(dir.path())
            .run(plan(vec![
                step("deps", StepCategory::Provision, "exit 1"),
                step("build", StepCategory::Build, "true"),
                step("test", StepCategory::Test, "true"),
                step("upload", StepCategory::Post, "test \"$MATRIX_CI_JOB_STATUS\" = failed"),
                step("cleanup", StepCategory::Post, "true"),
            ]))
            .await;

        assert_eq!(result.state, JobState::Failed);
        assert_eq!(
            statuses(&result),
            vec![
                ("deps", StepStatus::Failed),
                ("build", StepStatus::Skipped),
                ("test", StepStatus::Skipped),
                ("upload", StepStatus::Succeeded),
                ("cleanup", StepStatus::Succeeded),
            ]
        );
        assert_eq!(result.first_failure().unwrap().step_name, "deps");
    }

    #[tokio::test]
    async fn test_non_fail_fast_test_lets_later_categories_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut fast = step("test-fast", StepCategory::Test, "exit 1");
        fast.fail_fast = false;
        let result = executor(dir.path())
            .run(plan(vec![fast, step("test-serial", StepCategory::Test, "true")]))
            .await;

        assert_eq!(result.state, JobState::Failed);
        assert_eq!(result.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_allowed_step_failure_does_not_fail_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut extended = step("test-extended", StepCategory::Test, "exit 1");
        extended.allow_failure = true;
        let result = executor(dir.path())
            .run(plan(vec![extended, step("after", StepCategory::Test, "true")]))
            .await;

        assert_eq!(result.state, JobState::Succeeded);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failing_post_step_fails_job_but_not_other_posts() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(dir.path())
            .run(plan(vec![
                step("upload", StepCategory::Post, "exit 2"),
                step("cleanup", StepCategory::Post, "true"),
            ]))
            .await;
        assert_eq!(result.state, JobState::Failed);
        assert_eq!(result.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_coverage_from_test_steps_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let mut fast = step(
            "test-fast",
            StepCategory::Test,
            r#"echo '{"files": {"m.py": [1, 2]}}' > "$MATRIX_CI_COVERAGE_FILE""#,
        );
        fast.coverage_file = Some(PathBuf::from("fast.json"));
        let mut serial = step(
            "test-serial",
            StepCategory::Test,
            r#"printf 'SF:m.py\nDA:3,1\nend_of_record\n' > "$MATRIX_CI_COVERAGE_FILE""#,
        );
        serial.coverage_file = Some(PathBuf::from("serial.info"));
        let post = step(
            "upload",
            StepCategory::Post,
            r#"test -f "$MATRIX_CI_COVERAGE_REPORT""#,
        );

        let result = executor(dir.path())
            .run(plan(vec![fast, serial, post]))
            .await;

        assert_eq!(result.state, JobState::Succeeded);
        let merged = crate::coverage::CoverageReport::load(&result.coverage.unwrap()).unwrap();
        assert_eq!(merged.line_count(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_steps_records_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exec = JobExecutor::new(
            "run-test",
            dir.path(),
            ArtifactLayout::new(dir.path().join("artifacts")),
            cancel,
        );
        let result = exec
            .run(plan(vec![
                step("build", StepCategory::Build, "true"),
                step("post", StepCategory::Post, "true"),
            ]))
            .await;
        assert_eq!(result.state, JobState::Cancelled);
        assert!(result
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_result_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let p = plan(vec![step("build", StepCategory::Build, "true")]);
        let job = p.job.clone();
        exec.run(p).await;

        let path = ArtifactLayout::new(dir.path().join("artifacts"))
            .job_dir(&job)
            .join("result.json");
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["state"], "succeeded");
    }

    #[tokio::test]
    async fn test_unwritable_job_directory_fails_only_that_job() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let p = plan(vec![step("build", StepCategory::Build, "touch built")]);
        let job_dir = ArtifactLayout::new(dir.path().join("artifacts")).job_dir(&p.job);
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("coverage"), "not a directory").unwrap();

        let result = exec.run(p).await;

        assert_eq!(result.state, JobState::Failed);
        assert!(result.steps.is_empty());
        assert!(result.error.unwrap().contains("coverage"));
        assert!(!dir.path().join("built").exists());
    }
}
