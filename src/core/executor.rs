//! Stage Executor: runs one command stage as a unit of work.
//!
//! Commands run in order through the [`CommandRunner`] and the whole
//! attempt shares the stage timeout. A non-zero exit is retried with the
//! stage's backoff until `retry_count` is used up. A timeout or a
//! cancellation fails the stage straight away.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::artifact_store::ArtifactStore;
use super::event_store::{generate_idempotency_key, EventStore};
use super::pipeline::StageDef;
use crate::adapters::{CommandRunner, CommandSpec, LogSink, RunnerError};
use crate::domain::{Artifact, Event, EventType, LogLine, LogStream, StageResult, StageStatus, Trigger};
use crate::error::PipelineError;

/// What a stage runs against
pub struct StageContext<'a> {
    pub run_id: Uuid,
    pub trigger: &'a Trigger,
    /// Directory commands run in and artifacts are collected from
    pub workspace: &'a Path,
    /// Output of the most recent stage that produced one
    pub input: Option<&'a Artifact>,
    pub store: &'a EventStore,
    /// Receives every output line as it is produced
    pub log: &'a dyn LogSink,
    pub cancel: &'a CancellationToken,
}

pub struct StageExecutor {
    runner: Arc<dyn CommandRunner>,
    artifacts: Arc<ArtifactStore>,
}

impl StageExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, artifacts: Arc<ArtifactStore>) -> Self {
        Self { runner, artifacts }
    }

    /// Run `stage` to a terminal status.
    ///
    /// Returns `Err` only when the run's event log cannot be written.
    #[instrument(skip(self, stage, ctx), fields(run_id = %ctx.run_id, stage = %stage.name))]
    pub async fn run(&self, stage: &StageDef, ctx: &StageContext<'_>) -> Result<StageResult> {
        let started = StdInstant::now();
        let max_attempts = stage.max_attempts();
        let mut result = StageResult::pending(&stage.name).with_status(StageStatus::Running);

        loop {
            if ctx.cancel.is_cancelled() {
                result = result.with_status(StageStatus::Failed).with_error(PipelineError::Cancelled);
                break;
            }

            let attempt = result.attempts + 1;
            result.attempts = attempt;

            let start_event = Event::new(
                ctx.run_id,
                Some(stage.name.clone()),
                EventType::StageStarted,
                generate_idempotency_key(ctx.run_id, &stage.name, &format!("attempt-{}", attempt)),
                format!("Stage '{}' attempt {}/{}", stage.name, attempt, max_attempts),
            )
            .with_status(StageStatus::Running)
            .with_attempt(attempt);
            ctx.store.append(&start_event).await?;

            let header = LogLine::system(format!("attempt {}/{}", attempt, max_attempts));
            ctx.log.write(&stage.name, std::slice::from_ref(&header)).await?;
            result.logs.push(header);

            match self.attempt(stage, ctx, attempt, &mut result.logs).await? {
                Ok(()) => match self.collect_output(stage, ctx).await {
                    Ok(artifact) => {
                        if let Some(artifact) = &artifact {
                            let line = LogLine::system(format!(
                                "stored artifact {} ({} files)",
                                artifact.short_hash(),
                                artifact.files.len()
                            ));
                            ctx.log.write(&stage.name, std::slice::from_ref(&line)).await?;
                            result.logs.push(line);
                        }
                        result.output_artifact = artifact;
                        result.status = StageStatus::Succeeded;
                        info!(attempt, "Stage succeeded");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to store stage artifact");
                        result = result
                            .with_status(StageStatus::Failed)
                            .with_error(PipelineError::storage(format!("{:#}", e)));
                        break;
                    }
                },
                Err(e @ PipelineError::TransientStageFailure { .. }) if attempt < max_attempts => {
                    let delay = stage.retry_policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Stage failed, retrying"
                    );

                    let retry_event = Event::new(
                        ctx.run_id,
                        Some(stage.name.clone()),
                        EventType::StageRetrying,
                        generate_idempotency_key(ctx.run_id, &stage.name, &format!("retry-{}", attempt)),
                        format!("Stage '{}' failed, retrying in {:?}: {}", stage.name, delay, e),
                    )
                    .with_status(StageStatus::Running)
                    .with_attempt(attempt)
                    .with_error(e.to_string())
                    .with_payload(&e);
                    ctx.store.append(&retry_event).await?;
                    result.attempt_errors.push(e);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => {}
                    }
                }
                Err(PipelineError::TransientStageFailure { command, exit_code }) => {
                    let e = PipelineError::PermanentStageFailure {
                        stage: stage.name.clone(),
                        attempts: attempt,
                        last_error: format!("`{}` exited with code {}", command, exit_code),
                    };
                    error!(attempt, error = %e, "Stage failed permanently");
                    result = result.with_status(StageStatus::Failed).with_error(e);
                    break;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Stage failed without retry");
                    result = result.with_status(StageStatus::Failed).with_error(e);
                    break;
                }
            }
        }

        result.duration_ms = Some(started.elapsed().as_millis() as u64);
        Ok(result)
    }

    /// One pass over the stage's commands. The outer `Result` is for log I/O.
    async fn attempt(
        &self,
        stage: &StageDef,
        ctx: &StageContext<'_>,
        attempt: u32,
        logs: &mut Vec<LogLine>,
    ) -> Result<Result<(), PipelineError>> {
        let deadline = Instant::now() + stage.timeout();

        for command in &stage.commands {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Err(self.timed_out(stage)));
            }

            let spec = self.command_spec(stage, ctx, command, attempt, remaining);
            let echo = LogLine::system(format!("$ {}", command));
            ctx.log.write(&stage.name, std::slice::from_ref(&echo)).await?;
            logs.push(echo);
            debug!(%command, "Running command");

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Ok(Err(PipelineError::Cancelled)),
                outcome = self.runner.run(&spec) => outcome,
            };

            let output = match outcome {
                Ok(output) => output,
                Err(RunnerError::TimedOut(_)) => return Ok(Err(self.timed_out(stage))),
                Err(RunnerError::Launch(reason)) => {
                    let line = LogLine::system(format!("failed to launch: {}", reason));
                    ctx.log.write(&stage.name, std::slice::from_ref(&line)).await?;
                    logs.push(line);
                    return Ok(Err(PipelineError::TransientStageFailure {
                        command: command.clone(),
                        exit_code: -1,
                    }));
                }
            };

            let mut lines = LogLine::from_output(LogStream::Stdout, &output.stdout);
            lines.extend(LogLine::from_output(LogStream::Stderr, &output.stderr));
            ctx.log.write(&stage.name, &lines).await?;
            logs.extend(lines);

            if !output.success() {
                return Ok(Err(PipelineError::TransientStageFailure {
                    command: command.clone(),
                    exit_code: output.exit_code,
                }));
            }
        }

        Ok(Ok(()))
    }

    fn timed_out(&self, stage: &StageDef) -> PipelineError {
        PipelineError::StageTimeout {
            stage: stage.name.clone(),
            timeout_seconds: stage.timeout_seconds,
        }
    }

    fn command_spec(
        &self,
        stage: &StageDef,
        ctx: &StageContext<'_>,
        command: &str,
        attempt: u32,
        timeout: std::time::Duration,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(command, timeout)
            .workdir(ctx.workspace)
            .env("CONVEYOR_RUN_ID", ctx.run_id.to_string())
            .env("CONVEYOR_STAGE", &stage.name)
            .env("CONVEYOR_SOURCE_REVISION", &ctx.trigger.source_revision)
            .env("CONVEYOR_ENVIRONMENT", &ctx.trigger.environment)
            .env("CONVEYOR_ATTEMPT", attempt.to_string());
        if let Some(input) = ctx.input {
            spec = spec.env("CONVEYOR_INPUT_ARTIFACT", input.location.display().to_string());
        }
        for (key, value) in &stage.env {
            spec = spec.env(key, value);
        }
        spec
    }

    async fn collect_output(&self, stage: &StageDef, ctx: &StageContext<'_>) -> Result<Option<Artifact>> {
        let Some(spec) = &stage.artifacts else {
            return Ok(None);
        };
        let artifact = self
            .artifacts
            .store_files(ctx.run_id, &stage.name, ctx.workspace, &spec.files)
            .await?;
        Ok(Some(artifact))
    }
}
