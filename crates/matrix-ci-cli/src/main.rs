//! matrix-ci - matrix CI pipeline orchestrator CLI
//!
//! ## Commands
//!
//! - `validate`: Load and fully validate a pipeline document
//! - `expand`: List the jobs the matrix expands to
//! - `plan`: Show the resolved steps of each job
//! - `run`: Execute the pipeline (Ctrl-C cancels)
//!
//! Exit codes: 0 succeeded, 1 job failure, 2 configuration error,
//! 3 internal error, 130 cancelled.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{warn, Level};

use matrix_ci::{
    exit_code, ConfigError, JobState, Notifier, PipelineConfig, PipelineController,
    PipelineError, PipelineResult, PipelineState, ResolvedStep, StepStatus,
};
use matrix_ci_state::fakes::MemoryStatusStore;
use matrix_ci_state::{FileStatusStore, StatusStore};

#[derive(Parser)]
#[command(name = "matrix-ci")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Matrix CI pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline document (TOML, or JSON with a .json extension)
    #[arg(
        short = 'f',
        long,
        global = true,
        env = "MATRIX_CI_CONFIG",
        default_value = "matrix-ci.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the pipeline document without running anything
    Validate,

    /// List the jobs the matrix expands to
    Expand {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show the resolved steps of each job
    Plan {
        /// Only show this job number
        #[arg(long)]
        job: Option<usize>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Run the pipeline
    Run {
        #[command(flatten)]
        overrides: RunOverrides,

        /// Only run these job numbers (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<usize>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Settings that can be overridden from the command line or environment.
#[derive(clap::Args, Debug, Default)]
struct RunOverrides {
    /// Maximum number of jobs to run at once
    #[arg(long, env = "MATRIX_CI_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Root directory for job artifacts
    #[arg(long, env = "MATRIX_CI_ARTIFACTS_DIR")]
    artifacts_dir: Option<PathBuf>,

    /// File remembering last statuses for on_change notifications
    #[arg(long, env = "MATRIX_CI_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Working directory for steps
    #[arg(long)]
    workdir: Option<PathBuf>,
}

impl RunOverrides {
    fn apply(self, config: &mut PipelineConfig) {
        let settings = &mut config.settings;
        if let Some(n) = self.max_parallel {
            settings.max_parallel = Some(n);
        }
        if let Some(dir) = self.artifacts_dir {
            settings.artifacts_dir = dir;
        }
        if let Some(file) = self.state_file {
            settings.state_file = Some(file);
        }
        if let Some(dir) = self.workdir {
            settings.workdir = Some(dir);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    matrix_ci::init_tracing(cli.json, level);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Expand { format } => cmd_expand(&cli.config, format),
        Commands::Plan { job, format } => cmd_plan(&cli.config, job, format),
        Commands::Run { overrides, only } => cmd_run(&cli.config, overrides, only).await,
    }
}

/// Map an error to the process exit contract.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        exit_code::CONFIG_ERROR
    } else if let Some(e) = err.downcast_ref::<PipelineError>() {
        e.exit_code()
    } else {
        exit_code::INTERNAL_ERROR
    }
}

/// Validate the document, including every job's resolved plan
fn cmd_validate(path: &Path) -> Result<i32> {
    let config = PipelineConfig::load(path)?;
    let jobs = config.expand()?;
    let resolver = config.resolver();
    let mut resolved_steps = 0;
    for job in &jobs {
        resolved_steps += resolver.resolve(job)?.steps.len();
    }

    println!("✓ {} is valid", path.display());
    println!("  Pipeline: {}", config.settings.name);
    println!("  Axes: {}", config.axes.len());
    println!("  Jobs: {}", jobs.len());
    println!(
        "  Steps: {} declared, {} across all jobs",
        config.steps.len(),
        resolved_steps
    );
    println!("  Notification sinks: {}", config.notify.len());
    Ok(exit_code::SUCCESS)
}

#[derive(Serialize)]
struct JobRow<'a> {
    number: usize,
    label: &'a str,
    key: &'a str,
    axes: &'a std::collections::BTreeMap<String, String>,
    flags: Vec<&'a str>,
    allow_failure: bool,
}

/// List expanded jobs
fn cmd_expand(path: &Path, format: OutputFormat) -> Result<i32> {
    let config = PipelineConfig::load(path)?;
    let jobs = config.expand()?;

    match format {
        OutputFormat::Json => {
            let rows: Vec<JobRow<'_>> = jobs
                .iter()
                .map(|job| JobRow {
                    number: job.number,
                    label: &job.label,
                    key: job.key.as_str(),
                    axes: &job.spec.axes,
                    flags: job.spec.flags.iter().map(String::as_str).collect(),
                    allow_failure: job.allow_failure,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Text => {
            for job in &jobs {
                let tolerated = if job.allow_failure {
                    "  (allowed to fail)"
                } else {
                    ""
                };
                println!(
                    "#{:<3} {}  {}{}",
                    job.number,
                    job.key.short(),
                    job.label,
                    tolerated
                );
            }
            println!();
            println!("{} job(s)", jobs.len());
        }
    }
    Ok(exit_code::SUCCESS)
}

/// Show resolved step plans
fn cmd_plan(path: &Path, only: Option<usize>, format: OutputFormat) -> Result<i32> {
    let config = PipelineConfig::load(path)?;
    let mut controller =
        PipelineController::new(config, Notifier::new(Arc::new(MemoryStatusStore::new())))?;
    if let Some(number) = only {
        controller = controller.with_job_filter(vec![number]);
    }
    let plans = controller.plan()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plans)?),
        OutputFormat::Text => {
            for plan in &plans {
                println!("#{} {}", plan.job.number, plan.job.label);
                if plan.steps.is_empty() {
                    println!("  (no steps)");
                }
                for step in &plan.steps {
                    println!(
                        "  {:<9} {}: {}{}",
                        step.category.name(),
                        step.name,
                        display_command(step),
                        step_flags(step)
                    );
                }
                println!();
            }
        }
    }
    Ok(exit_code::SUCCESS)
}

/// Shell lines are shown as written; argv lists space-joined.
fn display_command(step: &ResolvedStep) -> String {
    match step.argv.as_slice() {
        [sh, flag, line] if sh == "sh" && flag == "-c" => line.clone(),
        argv => argv.join(" "),
    }
}

fn step_flags(step: &ResolvedStep) -> String {
    let mut flags = vec![format!("timeout={}s", step.timeout_secs)];
    if !step.fail_fast {
        flags.push("no-fail-fast".to_string());
    }
    if step.allow_failure {
        flags.push("allow-failure".to_string());
    }
    if let Some(file) = &step.coverage_file {
        flags.push(format!("coverage={}", file.display()));
    }
    format!("  [{}]", flags.join(", "))
}

/// Run the pipeline and print a summary
async fn cmd_run(path: &Path, overrides: RunOverrides, only: Vec<usize>) -> Result<i32> {
    let mut config = PipelineConfig::load(path)?;
    overrides.apply(&mut config);

    let store: Arc<dyn StatusStore> = match &config.settings.state_file {
        Some(file) => Arc::new(
            FileStatusStore::open(file)
                .await
                .with_context(|| format!("Failed to open state file {}", file.display()))?,
        ),
        None => Arc::new(MemoryStatusStore::new()),
    };
    let notifier = Notifier::from_configs(
        store,
        &config.notify,
        &config.settings.effective_workdir(),
    )?;

    let mut controller = PipelineController::new(config, notifier)?;
    if !only.is_empty() {
        controller = controller.with_job_filter(only);
    }

    let token = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling pipeline");
            token.cancel();
        }
    });

    let result = controller.run().await?;
    print_summary(&result);
    Ok(result.exit_code())
}

fn print_summary(result: &PipelineResult) {
    let status = match result.state {
        PipelineState::Succeeded => "✓ SUCCEEDED",
        PipelineState::Cancelled => "⊘ CANCELLED",
        _ => "✗ FAILED",
    };
    println!("Pipeline: {}", result.name);
    println!("Run ID: {}", result.run_id);
    println!("Status: {}", status);
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for job in &result.jobs {
        let mark = match job.state {
            JobState::Succeeded => "✓",
            JobState::Cancelled => "⊘",
            _ => "✗",
        };
        let ran = job
            .steps
            .iter()
            .filter(|s| !matches!(s.status, StepStatus::Skipped | StepStatus::Cancelled))
            .count();
        let tolerated = if job.job.allow_failure && job.state == JobState::Failed {
            " (allowed to fail)"
        } else {
            ""
        };
        println!(
            "  {} #{} {} ({}ms, {}/{} steps passed){}",
            mark,
            job.job.number,
            job.job.label,
            job.duration_ms,
            job.passed_count(),
            ran,
            tolerated
        );
    }

    println!();
    println!(
        "Summary: {}/{} jobs passed",
        result.passed_count(),
        result.jobs.len()
    );

    if !result.violations.is_empty() {
        println!("Violations:");
        for violation in &result.violations {
            println!("  - {}", violation);
        }
    }
    if !result.tolerated.is_empty() {
        println!("Tolerated failures:");
        for failure in &result.tolerated {
            println!("  - {}", failure);
        }
    }
}
