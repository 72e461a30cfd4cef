//! Command-line interface for conveyor.
//!
//! Provides commands for running pipelines, checking status, reading stage
//! logs, listing runs and targets, and rolling targets back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::config::{self, ResolvedConfig};
use crate::core::{EnginePaths, Pipeline, PipelineEngine, RolloutDefaults};
use crate::domain::{RunStatus, Trigger, TriggerCause};

/// conveyor - owned continuous delivery
#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline name (looks for <pipelines dir>/<name>.yaml) or path
        pipeline: String,

        /// Source revision to build and deploy
        #[arg(short, long)]
        revision: String,

        /// Environment the run targets
        #[arg(short, long, default_value = "production")]
        env: String,

        /// What started the run
        #[arg(long, value_enum, default_value = "manual")]
        cause: Cause,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Print a stage's log
    Logs {
        /// Run ID (UUID)
        run_id: String,

        /// Stage name
        stage: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List deployment targets and their revisions
    Targets,

    /// Roll back the rollout in flight on a target
    Rollback {
        /// Target name
        target: String,

        /// Pipeline that defines the target (supplies its traffic router)
        #[arg(short, long)]
        pipeline: Option<String>,
    },

    /// Check a pipeline definition without running it
    Validate {
        /// Pipeline name or path
        pipeline: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Cause {
    Push,
    Manual,
}

impl From<Cause> for TriggerCause {
    fn from(cause: Cause) -> Self {
        match cause {
            Cause::Push => TriggerCause::Push,
            Cause::Manual => TriggerCause::Manual,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Run {
                pipeline,
                revision,
                env,
                cause,
            } => {
                let trigger = Trigger {
                    source_revision: revision,
                    environment: env,
                    cause: cause.into(),
                };
                run_pipeline(cfg, &pipeline, trigger).await
            }
            Commands::Status { run_id } => show_status(cfg, &run_id).await,
            Commands::Logs { run_id, stage } => show_logs(cfg, &run_id, &stage).await,
            Commands::Runs { limit } => list_runs(cfg, limit).await,
            Commands::Targets => list_targets(cfg).await,
            Commands::Rollback { target, pipeline } => rollback(cfg, &target, pipeline.as_deref()).await,
            Commands::Validate { pipeline } => validate(cfg, &pipeline),
            Commands::Config => show_config(cfg),
        }
    }
}

fn engine(cfg: &ResolvedConfig) -> PipelineEngine {
    PipelineEngine::builder(EnginePaths::from_config(cfg))
        .notifications(cfg.notifications.clone())
        .build()
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

/// Run a pipeline, cancelling (and rolling back) on Ctrl-C
async fn run_pipeline(cfg: &ResolvedConfig, name: &str, trigger: Trigger) -> Result<()> {
    let pipeline = Arc::new(load_pipeline(cfg, name)?);
    let engine = Arc::new(engine(cfg));

    let handle = engine.trigger(pipeline, trigger);
    eprintln!("[Run {} started]", handle.run_id);

    let cancel = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[Cancelling run, active rollouts will be rolled back]");
            cancel.cancel();
        }
    });

    let run = handle.wait().await;
    interrupt.abort();
    let run = run?;

    for stage in &run.stages {
        let detail = stage
            .error
            .as_ref()
            .map(|e| format!(" - {}", e))
            .unwrap_or_default();
        eprintln!(
            "  {:<20} {:<12} attempts={}{}",
            stage.name,
            format!("{:?}", stage.status).to_lowercase(),
            stage.attempts,
            detail
        );
    }

    let reports = engine.flush_notifications().await;
    let undelivered = reports.iter().filter(|r| !r.delivered()).count();
    if undelivered > 0 {
        eprintln!("[{} notification(s) could not be delivered]", undelivered);
    }

    match &run.status {
        RunStatus::Succeeded => {
            eprintln!("\n[Run {} succeeded]", run.id);
            Ok(())
        }
        RunStatus::Failed { error } => {
            eprintln!("\n[Run {} failed: {}]", run.id, error);
            std::process::exit(1);
        }
        RunStatus::RolledBack { reason } => {
            eprintln!("\n[Run {} rolled back: {}]", run.id, reason);
            std::process::exit(2);
        }
        status => {
            eprintln!("\n[Run {} in state: {}]", run.id, status.label());
            Ok(())
        }
    }
}

/// Show the status of a run
async fn show_status(cfg: &ResolvedConfig, run_id: &str) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let run = engine(cfg)
        .get_run(run_id)
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!(
        "Trigger: {:?} {} -> {}",
        run.trigger.cause, run.trigger.source_revision, run.trigger.environment
    );
    println!("Status: {}", run.status.label());
    match &run.status {
        RunStatus::Failed { error } => println!("Error: {}", error),
        RunStatus::RolledBack { reason } => println!("Reason: {}", reason),
        _ => {}
    }
    println!("Created: {}", run.created_at);
    if let Some(started) = run.started_at {
        println!("Started: {}", started);
    }
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }

    println!("\nStages:");
    for stage in &run.stages {
        let duration = stage
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} {:<12} attempts={:<3} {}",
            stage.name,
            format!("{:?}", stage.status).to_lowercase(),
            stage.attempts,
            duration
        );
        for (i, error) in stage.attempt_errors.iter().enumerate() {
            println!("      retry {}: {}", i + 1, error);
        }
        if let Some(error) = &stage.error {
            println!("      error: {}", error);
        }
        if let Some(artifact) = &stage.output_artifact {
            println!("      artifact: {} ({} files)", artifact.short_hash(), artifact.files.len());
        }
        if let Some(rollout) = &stage.rollout {
            let phases: Vec<String> = rollout.phases().iter().map(|p| p.to_string()).collect();
            println!("      rollout {}: {}", rollout.target, phases.join(" -> "));
        }
    }

    Ok(())
}

async fn show_logs(cfg: &ResolvedConfig, run_id: &str, stage: &str) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    match engine(cfg).read_log(run_id, stage).await? {
        Some(log) => print!("{}", log),
        None => anyhow::bail!("No log for stage '{}' in run {}", stage, run_id),
    }
    Ok(())
}

/// List recent runs
async fn list_runs(cfg: &ResolvedConfig, limit: usize) -> Result<()> {
    let runs = engine(cfg).list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<12} {:<12}", "RUN ID", "PIPELINE", "STATUS", "REVISION");
    println!("{}", "-".repeat(86));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<12} {:<12}",
            run.id,
            run.pipeline_name,
            run.status.label(),
            run.trigger.source_revision
        );
    }

    Ok(())
}

async fn list_targets(cfg: &ResolvedConfig) -> Result<()> {
    let targets = engine(cfg).targets().await?;

    if targets.is_empty() {
        println!("No targets deployed yet");
        return Ok(());
    }

    println!(
        "{:<20} {:<14} {:<14} {:<10} {:<24}",
        "TARGET", "CURRENT", "PREVIOUS", "HEALTH", "TRAFFIC"
    );
    println!("{}", "-".repeat(86));

    for target in targets {
        let mut traffic = target.traffic.render();
        if let Some(in_flight) = &target.in_flight {
            traffic.push_str(&format!(" (rolling out {})", in_flight.revision));
        }
        println!(
            "{:<20} {:<14} {:<14} {:<10} {:<24}",
            target.name,
            target.current_revision.as_deref().unwrap_or("-"),
            target.previous_revision.as_deref().unwrap_or("-"),
            format!("{:?}", target.health).to_lowercase(),
            traffic
        );
    }

    Ok(())
}

async fn rollback(cfg: &ResolvedConfig, target: &str, pipeline: Option<&str>) -> Result<()> {
    let pipeline = pipeline.map(|name| load_pipeline(cfg, name)).transpose()?;

    match engine(cfg).rollback_target(pipeline.as_ref(), target).await? {
        Some(report) => {
            for line in &report.logs {
                eprintln!("{}", line.render());
            }
            eprintln!(
                "\n[Target {} rolled back to {}]",
                target,
                report.prior_revision.as_deref().unwrap_or("no revision")
            );
        }
        None => eprintln!("[Target {} has no rollout in flight, nothing to do]", target),
    }
    Ok(())
}

fn validate(cfg: &ResolvedConfig, name: &str) -> Result<()> {
    let pipeline = load_pipeline(cfg, name)?;
    println!(
        "Pipeline '{}' is valid: {} stages, {} targets",
        pipeline.name,
        pipeline.stages.len(),
        pipeline.targets.len()
    );
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Runs:       {}", cfg.runs_dir.display());
    println!("  Targets:    {}", cfg.targets_dir.display());
    println!("  Artifacts:  {}", cfg.artifacts_dir.display());
    println!("  Workspaces: {}", cfg.workspaces_dir.display());
    println!("  Pipelines:  {}", cfg.pipelines_dir.display());
    println!();
    println!("Notifications:");
    println!("  Log sink:     {}", cfg.notifications.log);
    println!("  Webhooks:     {}", cfg.notifications.webhooks.len());
    println!("  Commands:     {}", cfg.notifications.commands.len());
    println!("  Max attempts: {}", cfg.notifications.delivery.max_attempts);

    Ok(())
}

/// Load a pipeline by name or path
fn load_pipeline(cfg: &ResolvedConfig, name: &str) -> Result<Pipeline> {
    let candidates = [
        PathBuf::from(name),
        cfg.pipelines_dir.join(format!("{}.yaml", name)),
        PathBuf::from(format!("{}.yaml", name)),
    ];

    let Some(path) = candidates.iter().find(|p| p.is_file()) else {
        anyhow::bail!(
            "Pipeline '{}' not found. Looked for:\n{}",
            name,
            candidates
                .iter()
                .map(|p| format!("  - {}", p.display()))
                .collect::<Vec<_>>()
                .join("\n")
        );
    };

    load_pipeline_file(path, &cfg.rollout)
}

fn load_pipeline_file(path: &Path, defaults: &RolloutDefaults) -> Result<Pipeline> {
    let pipeline = Pipeline::from_file(path, defaults)?;
    pipeline
        .validate()
        .with_context(|| format!("Invalid pipeline: {}", path.display()))?;
    Ok(pipeline)
}
