//! Pipeline Engine: the per-run state machine.
//!
//! A run is created Pending, becomes Running, and drives its stages one
//! after another. Command stages go to the [`StageExecutor`], deploy
//! stages to the [`RolloutController`]. The first stage that does not
//! succeed ends the run (Failed, or RolledBack for a rolled back deploy)
//! and the remaining stages are recorded as Skipped. Every state change is
//! appended to the run's event log and applied to the in-memory run the
//! same way a replay would apply it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::artifact_store::ArtifactStore;
use super::event_store::{generate_idempotency_key, EventStore};
use super::executor::{StageContext, StageExecutor};
use super::notifier::{DeliveryReport, NotificationSettings, Notifier};
use super::pipeline::{DeploySpec, Pipeline, StageDef};
use super::rollout::{RolloutController, RolloutRequest};
use super::targets::TargetStore;
use crate::adapters::{CommandRunner, HealthProbe, LogSink, ShellRunner, TrafficRouter};
use crate::config::ResolvedConfig;
use crate::domain::{
    Artifact, DeploymentTarget, Event, EventType, NotificationEvent, PipelineRun, RolloutOutcome, RolloutReport,
    RunCreated, RunStatus, StageResult, StageStatus, Trigger,
};
use crate::error::PipelineError;

/// Where the engine keeps its state
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub runs: PathBuf,
    pub targets: PathBuf,
    pub artifacts: PathBuf,
    pub workspaces: PathBuf,
}

impl EnginePaths {
    /// Standard layout under one home directory
    pub fn under(home: &Path) -> Self {
        Self {
            runs: home.join("runs"),
            targets: home.join("targets"),
            artifacts: home.join("artifacts"),
            workspaces: home.join("workspaces"),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            runs: config.runs_dir.clone(),
            targets: config.targets_dir.clone(),
            artifacts: config.artifacts_dir.clone(),
            workspaces: config.workspaces_dir.clone(),
        }
    }
}

/// A run executing in the background
pub struct RunHandle {
    pub run_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<Result<PipelineRun>>,
}

impl RunHandle {
    /// Ask the run to stop. An active rollout is rolled back.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to reach a terminal status
    pub async fn wait(self) -> Result<PipelineRun> {
        self.handle.await.context("Run task panicked")?
    }
}

pub struct EngineBuilder {
    paths: EnginePaths,
    runner: Option<Arc<dyn CommandRunner>>,
    notifier: Option<Notifier>,
    notifications: NotificationSettings,
    probe: Option<Arc<dyn HealthProbe>>,
    router: Option<Arc<dyn TrafficRouter>>,
}

impl EngineBuilder {
    /// Runs stage commands, hooks and command adapters. Defaults to `sh -c`.
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Subscribers built from settings
    pub fn notifications(mut self, settings: NotificationSettings) -> Self {
        self.notifications = settings;
        self
    }

    /// A ready-made notifier; takes precedence over `notifications`
    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Probe every target with `probe` instead of its configured one
    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Route every target's traffic through `router`
    pub fn router(mut self, router: Arc<dyn TrafficRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn build(self) -> PipelineEngine {
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ShellRunner::new()) as Arc<dyn CommandRunner>);
        let artifacts = Arc::new(ArtifactStore::new(&self.paths.artifacts));
        let targets = Arc::new(TargetStore::new(&self.paths.targets));
        let notifier = self
            .notifier
            .unwrap_or_else(|| self.notifications.build(runner.clone()));

        PipelineEngine {
            executor: StageExecutor::new(runner.clone(), artifacts),
            rollouts: RolloutController::new(targets, runner.clone()),
            notifier: Arc::new(notifier),
            overrides: Mutex::new(HashMap::new()),
            paths: self.paths,
            runner,
            probe: self.probe,
            router: self.router,
        }
    }
}

/// What ended a run early
struct Halt {
    event_type: EventType,
    reason: String,
}

pub struct PipelineEngine {
    paths: EnginePaths,
    runner: Arc<dyn CommandRunner>,
    executor: StageExecutor,
    rollouts: RolloutController,
    notifier: Arc<Notifier>,
    /// Notifiers for pipelines that declare their own subscribers
    overrides: Mutex<HashMap<String, Arc<Notifier>>>,
    probe: Option<Arc<dyn HealthProbe>>,
    router: Option<Arc<dyn TrafficRouter>>,
}

impl PipelineEngine {
    pub fn builder(paths: EnginePaths) -> EngineBuilder {
        EngineBuilder {
            paths,
            runner: None,
            notifier: None,
            notifications: NotificationSettings::default(),
            probe: None,
            router: None,
        }
    }

    pub fn paths(&self) -> &EnginePaths {
        &self.paths
    }

    /// Start a run in the background
    pub fn trigger(self: &Arc<Self>, pipeline: Arc<Pipeline>, trigger: Trigger) -> RunHandle {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let engine = self.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move { engine.execute(run_id, &pipeline, trigger, &token).await });

        RunHandle {
            run_id,
            cancel,
            handle,
        }
    }

    /// Run a pipeline to completion
    pub async fn run(&self, pipeline: &Pipeline, trigger: Trigger, cancel: &CancellationToken) -> Result<PipelineRun> {
        self.execute(Uuid::new_v4(), pipeline, trigger, cancel).await
    }

    #[instrument(skip(self, pipeline, trigger, cancel), fields(pipeline = %pipeline.name, revision = %trigger.source_revision))]
    async fn execute(
        &self,
        run_id: Uuid,
        pipeline: &Pipeline,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun> {
        pipeline.validate()?;
        info!(%run_id, environment = %trigger.environment, "Starting pipeline run");

        let store = EventStore::open_in(&self.paths.runs, run_id).await?;
        let stage_names = pipeline.stage_names();
        let mut run = PipelineRun::new(run_id, pipeline.name.clone(), trigger.clone(), &stage_names);

        let created = Event::new(
            run_id,
            None,
            EventType::RunCreated,
            format!("{}:created", run_id),
            format!("Pipeline '{}' triggered at {}", pipeline.name, trigger.source_revision),
        )
        .with_payload(&RunCreated {
            pipeline: pipeline.name.clone(),
            trigger: trigger.clone(),
            stages: stage_names,
        });
        store.append(&created).await?;
        run.created_at = created.timestamp;

        let halt = match self.drive(&store, &mut run, pipeline, &trigger, cancel).await {
            Ok(halt) => halt,
            Err(e) => {
                error!(%run_id, error = %format!("{:#}", e), "Run aborted");
                Some(Halt {
                    event_type: EventType::RunFailed,
                    reason: PipelineError::storage(format!("{:#}", e)).to_string(),
                })
            }
        };

        let event = match halt {
            None => Event::new(
                run_id,
                None,
                EventType::RunSucceeded,
                format!("{}:complete", run_id),
                format!("Pipeline '{}' succeeded", pipeline.name),
            ),
            Some(halt) => Event::new(
                run_id,
                None,
                halt.event_type,
                format!("{}:complete", run_id),
                format!("Pipeline '{}' ended: {}", pipeline.name, halt.reason),
            )
            .with_error(halt.reason),
        };
        record(&store, &mut run, event).await?;

        match &run.status {
            RunStatus::Succeeded => info!(%run_id, "Run succeeded"),
            status => warn!(%run_id, status = status.label(), "Run did not succeed"),
        }

        self.notify(&store, &run, pipeline).await;
        Ok(run)
    }

    /// Execute the stages in order. Returns why the run stopped early, if it did.
    async fn drive(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        pipeline: &Pipeline,
        trigger: &Trigger,
        cancel: &CancellationToken,
    ) -> Result<Option<Halt>> {
        let run_id = run.id;
        record(
            store,
            run,
            Event::new(
                run_id,
                None,
                EventType::RunStarted,
                format!("{}:start", run_id),
                format!("Pipeline '{}' started", pipeline.name),
            ),
        )
        .await?;

        let workspace = self.paths.workspaces.join(run_id.to_string());
        fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("Failed to create workspace: {}", workspace.display()))?;

        let mut input: Option<Artifact> = None;
        let mut halt: Option<Halt> = None;

        for stage in &pipeline.stages {
            if halt.is_some() {
                let skipped = Event::new(
                    run_id,
                    Some(stage.name.clone()),
                    EventType::StageSkipped,
                    generate_idempotency_key(run_id, &stage.name, "skipped"),
                    format!("Stage '{}' skipped", stage.name),
                )
                .with_status(StageStatus::Skipped);
                record(store, run, skipped).await?;
                continue;
            }

            let result = match &stage.deploy {
                Some(deploy) => {
                    self.run_deploy(store, run, pipeline, stage, deploy, trigger, input.as_ref(), cancel)
                        .await?
                }
                None => {
                    let ctx = StageContext {
                        run_id,
                        trigger,
                        workspace: &workspace,
                        input: input.as_ref(),
                        store,
                        log: store,
                        cancel,
                    };
                    self.executor.run(stage, &ctx).await?
                }
            };

            let event_type = match result.status {
                StageStatus::Succeeded => EventType::StageSucceeded,
                StageStatus::RolledBack => EventType::StageRolledBack,
                _ => EventType::StageFailed,
            };
            let mut event = Event::new(
                run_id,
                Some(stage.name.clone()),
                event_type,
                generate_idempotency_key(run_id, &stage.name, "result"),
                stage_summary(&result),
            )
            .with_status(result.status)
            .with_attempt(result.attempts)
            .with_payload(&result);
            if let Some(ms) = result.duration_ms {
                event = event.with_duration(ms);
            }
            if let Some(e) = &result.error {
                event = event.with_error(e.to_string());
            }
            record(store, run, event).await?;

            match result.status {
                StageStatus::Succeeded => {
                    if let Some(artifact) = result.output_artifact {
                        input = Some(artifact);
                    }
                }
                StageStatus::RolledBack => {
                    halt = Some(Halt {
                        event_type: EventType::RunRolledBack,
                        reason: failure_reason(&result),
                    });
                }
                _ => {
                    halt = Some(Halt {
                        event_type: EventType::RunFailed,
                        reason: failure_reason(&result),
                    });
                }
            }
        }

        Ok(halt)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_deploy(
        &self,
        store: &EventStore,
        run: &mut PipelineRun,
        pipeline: &Pipeline,
        stage: &StageDef,
        deploy: &DeploySpec,
        trigger: &Trigger,
        input: Option<&Artifact>,
        cancel: &CancellationToken,
    ) -> Result<StageResult> {
        let run_id = run.id;
        let started = Instant::now();
        let mut result = StageResult::pending(&stage.name).with_status(StageStatus::Running);
        result.attempts = 1;

        record(
            store,
            run,
            Event::new(
                run_id,
                Some(stage.name.clone()),
                EventType::StageStarted,
                generate_idempotency_key(run_id, &stage.name, "attempt-1"),
                format!("Deploying to '{}'", deploy.target),
            )
            .with_status(StageStatus::Running)
            .with_attempt(1),
        )
        .await?;

        let Some(target) = pipeline.targets.get(&deploy.target) else {
            return Ok(result.with_status(StageStatus::Failed).with_error(PipelineError::UnknownTarget {
                target: deploy.target.clone(),
            }));
        };
        if cancel.is_cancelled() {
            return Ok(result
                .with_status(StageStatus::Failed)
                .with_error(PipelineError::Cancelled));
        }

        let probe = match &self.probe {
            Some(probe) => probe.clone(),
            None => match target.probe(self.runner.clone()) {
                Ok(probe) => probe,
                Err(e) => {
                    warn!(stage = %stage.name, error = %format!("{:#}", e), "Health probe unavailable");
                    result.duration_ms = Some(started.elapsed().as_millis() as u64);
                    return Ok(result
                        .with_status(StageStatus::Failed)
                        .with_error(PipelineError::PermanentStageFailure {
                            stage: stage.name.clone(),
                            attempts: 1,
                            last_error: format!("{:#}", e),
                        }));
                }
            },
        };
        let router = self
            .router
            .clone()
            .or_else(|| target.router(self.runner.clone()));

        let request = RolloutRequest {
            run_id,
            target: deploy.target.clone(),
            hosts: target.hosts.clone(),
            revision: deploy
                .revision
                .clone()
                .unwrap_or_else(|| trigger.source_revision.clone()),
            artifact: input.cloned(),
            spec: deploy.clone(),
            deadline: Some(stage.timeout()),
            probe,
            router,
        };

        let report = self.rollouts.deploy(request, cancel).await?;

        // Phases repeat across traffic steps, so the key carries the position
        for (i, transition) in report.transitions.iter().enumerate() {
            let event = Event::new(
                run_id,
                Some(stage.name.clone()),
                EventType::RolloutPhaseChanged,
                generate_idempotency_key(run_id, &stage.name, &format!("{}:{}", report.rollout_id, i)),
                format!("{} -> {}: {}", report.target, transition.phase, transition.detail),
            )
            .with_payload(transition);
            record(store, run, event).await?;
        }
        store.write(&stage.name, &report.logs).await?;

        result.logs = report.logs.clone();
        match &report.outcome {
            RolloutOutcome::Complete | RolloutOutcome::AlreadyCurrent => {
                result.status = StageStatus::Succeeded;
            }
            RolloutOutcome::RolledBack { reason } => {
                let error = report.error.clone().unwrap_or_else(|| PipelineError::TrafficShiftFailure {
                    target: report.target.clone(),
                    reason: reason.clone(),
                });
                result = result.with_status(StageStatus::RolledBack).with_error(error);
            }
        }
        result.rollout = Some(report);
        result.duration_ms = Some(started.elapsed().as_millis() as u64);
        Ok(result)
    }

    /// Publish the terminal status. Delivery happens in the background.
    async fn notify(&self, store: &EventStore, run: &PipelineRun, pipeline: &Pipeline) {
        let error = match &run.status {
            RunStatus::Failed { error } => Some(error.clone()),
            RunStatus::RolledBack { reason } => Some(reason.clone()),
            _ => None,
        };
        let event = NotificationEvent {
            run_id: run.id,
            pipeline: run.pipeline_name.clone(),
            status: run.status.clone(),
            timestamp: Utc::now(),
            source_revision: run.trigger.source_revision.clone(),
            environment: run.trigger.environment.clone(),
            error,
        };

        let notifier = self.notifier_for(pipeline);
        notifier.publish(event);

        let published = Event::new(
            run.id,
            None,
            EventType::NotificationPublished,
            format!("{}:notified", run.id),
            format!("Notified {} subscribers", notifier.subscriber_count()),
        );
        if let Err(e) = store.append(&published).await {
            warn!(run_id = %run.id, error = %e, "Failed to record notification");
        }
    }

    fn notifier_for(&self, pipeline: &Pipeline) -> Arc<Notifier> {
        let Some(settings) = &pipeline.notifications else {
            return self.notifier.clone();
        };
        let mut overrides = self
            .overrides
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        overrides
            .entry(pipeline.name.clone())
            .or_insert_with(|| Arc::new(settings.build(self.runner.clone())))
            .clone()
    }

    /// Wait for outstanding notification deliveries
    pub async fn flush_notifications(&self) -> Vec<DeliveryReport> {
        let overrides: Vec<Arc<Notifier>> = {
            let overrides = self
                .overrides
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            overrides.values().cloned().collect()
        };

        let mut reports = self.notifier.flush().await;
        for notifier in overrides {
            reports.extend(notifier.flush().await);
        }
        reports
    }

    /// Rebuild a run from its event log
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        if !self.paths.runs.join(run_id.to_string()).exists() {
            return Ok(None);
        }
        let store = EventStore::open_in(&self.paths.runs, run_id).await?;
        let events = store.replay().await?;
        Ok(PipelineRun::from_events(&events))
    }

    /// Most recent runs first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let mut runs = Vec::new();
        for run_id in EventStore::list_runs_in(&self.paths.runs).await? {
            if let Some(run) = self.get_run(run_id).await? {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    /// A stage's log file for a run
    pub async fn read_log(&self, run_id: Uuid, stage: &str) -> Result<Option<String>> {
        if !self.paths.runs.join(run_id.to_string()).exists() {
            return Ok(None);
        }
        let store = EventStore::open_in(&self.paths.runs, run_id).await?;
        store.read_log(stage).await
    }

    pub async fn targets(&self) -> Result<Vec<DeploymentTarget>> {
        self.rollouts.targets().list().await
    }

    /// Roll back whatever rollout is in flight on `target`.
    /// The pipeline, when given, supplies the target's traffic router.
    pub async fn rollback_target(&self, pipeline: Option<&Pipeline>, target: &str) -> Result<Option<RolloutReport>> {
        let router = self.router.clone().or_else(|| {
            pipeline
                .and_then(|p| p.targets.get(target))
                .and_then(|def| def.router(self.runner.clone()))
        });
        self.rollouts.rollback(target, router).await
    }
}

/// Append an event and apply it to the in-memory run, as replay would
async fn record(store: &EventStore, run: &mut PipelineRun, event: Event) -> Result<()> {
    if store.append(&event).await? {
        run.apply_event(&event);
    }
    Ok(())
}

fn stage_summary(result: &StageResult) -> String {
    match &result.error {
        None => format!(
            "Stage '{}' {:?} after {} attempt(s)",
            result.name, result.status, result.attempts
        ),
        Some(e) => format!("Stage '{}' {:?}: {}", result.name, result.status, e),
    }
}

fn failure_reason(result: &StageResult) -> String {
    result
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| format!("stage '{}' did not succeed", result.name))
}
