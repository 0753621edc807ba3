//! On-disk artifact layout.
//!
//! ```text
//! <root>/
//!   pipeline.json
//!   jobs/<NNN>-<key12>/
//!     log.txt
//!     coverage/        per-category coverage files written by test steps
//!     coverage.json    merged coverage
//!     result.json
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::job::{Job, JobResult};
use crate::runner::StepResult;

/// Root of the artifact tree for one pipeline run.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pipeline_file(&self) -> PathBuf {
        self.root.join("pipeline.json")
    }

    /// Directory of one job; unique per job number and identity.
    pub fn job_dir(&self, job: &Job) -> PathBuf {
        self.root
            .join("jobs")
            .join(format!("{:03}-{}", job.number, job.key.short()))
    }

    /// Create the job directory tree, clearing stale coverage from a
    /// previous run.
    pub fn prepare_job(&self, job: &Job) -> Result<JobArtifacts> {
        let dir = self.job_dir(job);
        let artifacts = JobArtifacts {
            coverage_dir: dir.join("coverage"),
            log_bundle: dir.join("log.txt"),
            merged_coverage: dir.join("coverage.json"),
            result_file: dir.join("result.json"),
            dir,
        };
        if artifacts.coverage_dir.exists() {
            std::fs::remove_dir_all(&artifacts.coverage_dir)
                .map_err(|e| io_err(&artifacts.coverage_dir, e))?;
        }
        std::fs::create_dir_all(&artifacts.coverage_dir)
            .map_err(|e| io_err(&artifacts.coverage_dir, e))?;
        Ok(artifacts)
    }

    pub fn write_pipeline<T: serde::Serialize>(&self, summary: &T) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
        let path = self.pipeline_file();
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, json).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }
}

/// Paths owned by a single job.
#[derive(Debug, Clone)]
pub struct JobArtifacts {
    pub dir: PathBuf,
    pub coverage_dir: PathBuf,
    pub log_bundle: PathBuf,
    pub merged_coverage: PathBuf,
    pub result_file: PathBuf,
}

impl JobArtifacts {
    /// Where a test step writes its coverage file.
    pub fn coverage_path(&self, file: &Path) -> PathBuf {
        self.coverage_dir.join(file)
    }

    /// Concatenate every step's output, in execution order.
    pub fn write_log_bundle(&self, job: &Job, steps: &[StepResult]) -> Result<PathBuf> {
        let path = &self.log_bundle;
        let mut file = std::fs::File::create(path).map_err(|e| io_err(path, e))?;
        let mut body = format!("# job {} [{}] {}\n", job.number, job.key.short(), job.label);
        for step in steps {
            body.push_str(&format!(
                "\n==> {} ({}) status={} exit={} duration_ms={}\n",
                step.step_name,
                step.category,
                step.status,
                step.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                step.duration_ms,
            ));
            if let Some(error) = &step.error {
                body.push_str(&format!("error: {error}\n"));
            }
            if !step.stdout.is_empty() {
                body.push_str("--- stdout\n");
                body.push_str(&step.stdout);
                if !step.stdout.ends_with('\n') {
                    body.push('\n');
                }
            }
            if !step.stderr.is_empty() {
                body.push_str("--- stderr\n");
                body.push_str(&step.stderr);
                if !step.stderr.ends_with('\n') {
                    body.push('\n');
                }
            }
        }
        file.write_all(body.as_bytes())
            .map_err(|e| io_err(path, e))?;
        Ok(path.clone())
    }

    pub fn write_result(&self, result: &JobResult) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(result)?;
        std::fs::write(&self.result_file, json).map_err(|e| io_err(&self.result_file, e))?;
        Ok(self.result_file.clone())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> PipelineError {
    PipelineError::Artifact {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use crate::runner::StepStatus;
    use crate::step::StepCategory;
    use chrono::Utc;

    fn job(number: usize, os: &str) -> Job {
        Job::new(number, JobSpec::new().with_axis("os", os), &["os".to_string()])
    }

    #[test]
    fn test_job_dirs_are_unique() {
        let layout = ArtifactLayout::new("/tmp/run");
        let a = layout.job_dir(&job(1, "linux"));
        let b = layout.job_dir(&job(2, "osx"));
        assert_ne!(a, b);
        assert!(a.ends_with(format!("001-{}", job(1, "linux").key.short())));
    }

    #[test]
    fn test_prepare_clears_stale_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let j = job(1, "linux");

        let first = layout.prepare_job(&j).unwrap();
        std::fs::write(first.coverage_path(Path::new("old.json")), "{}").unwrap();

        let second = layout.prepare_job(&j).unwrap();
        assert!(second.coverage_dir.is_dir());
        assert!(!second.coverage_path(Path::new("old.json")).exists());
    }

    #[test]
    fn test_log_bundle_contains_step_output() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let j = job(3, "osx");
        let artifacts = layout.prepare_job(&j).unwrap();

        let step = StepResult {
            step_name: "build".to_string(),
            category: StepCategory::Build,
            status: StepStatus::Failed,
            exit_code: Some(2),
            stdout: "compiling".to_string(),
            stderr: "error: boom\n".to_string(),
            started_at: Utc::now(),
            duration_ms: 12,
            allow_failure: false,
            error: None,
        };
        let path = artifacts.write_log_bundle(&j, &[step]).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("==> build (build) status=failed exit=2"));
        assert!(text.contains("compiling\n"));
        assert!(text.contains("error: boom"));
    }
}
