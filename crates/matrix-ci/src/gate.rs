//! Pipeline gate: turns job results into the final pipeline status.

use serde::{Deserialize, Serialize};

use crate::job::{JobResult, JobState};
use crate::pipeline::PipelineState;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Final pipeline state.
    pub state: PipelineState,

    /// Failures that fail the pipeline (empty if passed).
    pub violations: Vec<String>,

    /// Failures of jobs allowed to fail; reported, not counted.
    pub tolerated: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Pipeline pass/fail rules.
pub struct PipelineGate;

impl PipelineGate {
    /// Evaluate finished jobs.
    ///
    /// - Cancellation requested: `cancelled`, regardless of job outcomes.
    /// - Any job not allowed to fail that did not succeed: `failed`.
    /// - Otherwise `succeeded`.
    pub fn evaluate(jobs: &[JobResult], cancelled: bool) -> GateVerdict {
        let mut violations = Vec::new();
        let mut tolerated = Vec::new();

        for result in jobs {
            let job = &result.job;
            let reason = match result.state {
                JobState::Succeeded => continue,
                JobState::Failed => match result.first_failure() {
                    Some(step) => format!(
                        "Job #{} ({}) failed at step '{}': {}",
                        job.number,
                        job.label,
                        step.step_name,
                        step.error.clone().unwrap_or_else(|| match step.exit_code {
                            Some(code) => format!("exit code {code}"),
                            None => step.status.to_string(),
                        })
                    ),
                    None => match &result.error {
                        Some(error) => format!("Job #{} ({}) failed: {error}", job.number, job.label),
                        None => format!("Job #{} ({}) failed", job.number, job.label),
                    },
                },
                JobState::Cancelled => format!("Job #{} ({}) was cancelled", job.number, job.label),
                other => format!(
                    "Job #{} ({}) never completed (state: {other})",
                    job.number, job.label
                ),
            };
            if job.allow_failure {
                tolerated.push(reason);
            } else {
                violations.push(reason);
            }
        }

        let state = if cancelled {
            PipelineState::Cancelled
        } else if violations.is_empty() {
            PipelineState::Succeeded
        } else {
            PipelineState::Failed
        };
        let passed = state == PipelineState::Succeeded;

        let message = match state {
            PipelineState::Succeeded if tolerated.is_empty() => {
                format!("All {} job(s) passed", jobs.len())
            }
            PipelineState::Succeeded => format!(
                "Passed with {} tolerated failure(s)",
                tolerated.len()
            ),
            PipelineState::Cancelled => "Pipeline was cancelled".to_string(),
            _ => format!("Gate failed with {} violation(s)", violations.len()),
        };

        GateVerdict {
            passed,
            state,
            violations,
            tolerated,
            message,
        }
    }
}
