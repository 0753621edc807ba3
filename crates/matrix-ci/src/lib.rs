//! matrix-ci - matrix CI pipeline orchestration
//!
//! Provides a CI pipeline orchestrator that:
//! - Expands a build matrix (axes, inclusion/exclusion rules) into jobs
//! - Resolves conditional provision/build/test/post steps per job
//! - Runs steps as subprocesses with timeouts, fail-fast and cancellation
//! - Merges per-category coverage artifacts into one report per job
//! - Notifies sinks on terminal job and pipeline status transitions

pub mod artifacts;
pub mod axis;
pub mod condition;
pub mod config;
pub mod coverage;
pub mod error;
pub mod executor;
pub mod expand;
pub mod gate;
pub mod job;
pub mod notify;
pub mod obs;
pub mod pipeline;
pub mod resolve;
pub mod runner;
pub mod step;
pub mod telemetry;
pub mod template;

// Re-export key types
pub use artifacts::{ArtifactLayout, JobArtifacts};
pub use axis::{Axis, AxisSet};
pub use condition::Condition;
pub use config::{PipelineConfig, RuleDef, Settings};
pub use coverage::{CoverageAggregator, CoverageError, CoverageReport, CoverageSummary};
pub use error::{ConfigError, PipelineError, Result};
pub use executor::JobExecutor;
pub use expand::{JobExpander, MatrixRules};
pub use gate::{GateVerdict, PipelineGate};
pub use job::{Job, JobKey, JobResult, JobSpec, JobState};
pub use notify::{
    CommandSink, LogSink, Notification, NotificationKind, NotificationSink, Notifier, NotifyError,
    NotifyPolicy, RecordingSink, SinkConfig, SinkRule, SinkTransport, WebhookSink,
};
pub use pipeline::{exit_code, PipelineController, PipelineResult, PipelineState};
pub use resolve::{EnvironmentResolver, JobPlan, ResolvedStep};
pub use runner::{StepContext, StepResult, StepRunner, StepStatus};
pub use step::{CommandSpec, StepCategory, StepConfig};
pub use telemetry::init_tracing;
