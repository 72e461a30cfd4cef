//! Rollout Controller.
//!
//! Drives one deploy through `Provisioning -> TrafficShifting -> Verifying`
//! until it is `Complete`, or through `RollingBack -> RolledBack` when a
//! hook fails, a health check fails, the deadline passes or the run is
//! cancelled. The target's lease is held for the whole rollout.
//!
//! The in-flight record is persisted before any host is touched. It holds
//! everything a rollback needs, so [`RolloutController::rollback`] works
//! the same for a failing rollout, an operator request and a rollout left
//! behind by a crash.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::health::HealthChecker;
use super::pipeline::DeploySpec;
use super::targets::{TargetLease, TargetStore};
use crate::adapters::{CommandRunner, CommandSpec, HealthProbe, RunnerError, TrafficRouter};
use crate::domain::deploy::INSTALL_SEQUENCE;
use crate::domain::{
    Artifact, DeploymentHooks, DeploymentTarget, HealthState, HookName, InFlightRollout, LogLine, LogStream,
    PhaseTransition, RolloutOutcome, RolloutPhase, RolloutReport, Strategy, TrafficSplit,
};
use crate::error::PipelineError;

/// Everything needed to roll one revision out to one target
#[derive(Clone)]
pub struct RolloutRequest {
    pub run_id: Uuid,
    pub target: String,
    pub hosts: Vec<String>,
    pub revision: String,
    /// Artifact the hooks install from
    pub artifact: Option<Artifact>,
    pub spec: DeploySpec,
    /// Overall deadline, measured from when the target lease is acquired
    pub deadline: Option<Duration>,
    pub probe: Arc<dyn HealthProbe>,
    pub router: Option<Arc<dyn TrafficRouter>>,
}

impl RolloutRequest {
    fn deadline_seconds(&self) -> u64 {
        self.deadline.map(|d| d.as_secs()).unwrap_or(0)
    }
}

/// Phase bookkeeping for one rollout
struct Recorder {
    target: String,
    phase: RolloutPhase,
    transitions: Vec<PhaseTransition>,
    logs: Vec<LogLine>,
}

impl Recorder {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            phase: RolloutPhase::Idle,
            transitions: Vec::new(),
            logs: Vec::new(),
        }
    }

    fn enter(&mut self, phase: RolloutPhase, detail: impl Into<String>) {
        let detail = detail.into();
        if !self.phase.can_transition_to(phase) {
            warn!(target_name = %self.target, from = %self.phase, to = %phase, "Unexpected rollout transition");
        }
        info!(target_name = %self.target, phase = %phase, %detail, "Rollout phase");
        self.logs.push(LogLine::system(format!("{}: {}", phase, detail)));
        self.transitions.push(PhaseTransition {
            phase,
            at: Utc::now(),
            detail,
        });
        self.phase = phase;
    }

    fn note(&mut self, line: impl Into<String>) {
        self.logs.push(LogLine::system(line));
    }
}

/// State shared by the steps of one rollout
struct Session<'a> {
    req: &'a RolloutRequest,
    cancel: &'a CancellationToken,
    deadline: Option<Instant>,
    rec: Recorder,
}

/// Which revision a hook acts on
struct HookTarget<'a> {
    target: &'a str,
    hooks: &'a DeploymentHooks,
    revision: &'a str,
    artifact_dir: Option<&'a Path>,
}

pub struct RolloutController {
    targets: Arc<TargetStore>,
    runner: Arc<dyn CommandRunner>,
}

impl RolloutController {
    pub fn new(targets: Arc<TargetStore>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { targets, runner }
    }

    pub fn targets(&self) -> &Arc<TargetStore> {
        &self.targets
    }

    /// Roll `req.revision` out to `req.target`.
    ///
    /// Rollout failures are not errors: they come back as a report whose
    /// outcome is `RolledBack`. `Err` means the target record could not be
    /// read or written.
    #[instrument(skip(self, req, cancel), fields(target_name = %req.target, revision = %req.revision))]
    pub async fn deploy(&self, req: RolloutRequest, cancel: &CancellationToken) -> Result<RolloutReport> {
        let lease = self.targets.lock(&req.target).await;
        let mut target = self.targets.load_or_init(&lease, &req.hosts).await?;

        let mut session = Session {
            req: &req,
            cancel,
            deadline: req.deadline.map(|d| Instant::now() + d),
            rec: Recorder::new(&req.target),
        };

        if target.is_rolling_out() {
            warn!("Target has an interrupted rollout, rolling it back first");
            session.rec.note("rolling back interrupted rollout");
            self.restore(&lease, &mut target, req.router.as_ref(), &mut session.rec.logs)
                .await?;
        }

        let rollout_id = Uuid::new_v4();
        let prior_revision = target.current_revision.clone();

        if target.is_at(&req.revision) {
            session
                .rec
                .enter(RolloutPhase::Complete, format!("already at {}", req.revision));
            return Ok(report(rollout_id, &req, prior_revision, RolloutOutcome::AlreadyCurrent, None, &target, session.rec));
        }

        target.in_flight = Some(InFlightRollout {
            rollout_id,
            run_id: req.run_id,
            revision: req.revision.clone(),
            prior_revision: prior_revision.clone(),
            prior_traffic: target.traffic.clone(),
            strategy: req.spec.strategy,
            hooks: req.spec.hooks.clone(),
            artifact_dir: req.artifact.as_ref().map(|a| a.location.clone()),
            prior_artifact_dir: target.artifact_dir.clone(),
            replaced_hosts: Vec::new(),
            started_at: Utc::now(),
        });
        self.targets.save(&lease, &mut target).await?;

        match self.advance(&lease, &mut target, &mut session).await {
            Ok(()) => {
                let old_artifact = target.artifact_dir.clone();
                target.promote(&req.revision, req.artifact.as_ref().map(|a| a.location.clone()));
                target.health = HealthState::Healthy;
                self.targets.save(&lease, &mut target).await?;
                session.rec.enter(
                    RolloutPhase::Complete,
                    format!("{} serving 100% on {}", req.revision, req.target),
                );

                if req.spec.strategy == Strategy::BlueGreen {
                    if let Some(old) = prior_revision.as_deref() {
                        self.stop_old(&target, &req.spec.hooks, old, old_artifact.as_deref(), &mut session.rec)
                            .await;
                    }
                }

                Ok(report(rollout_id, &req, prior_revision, RolloutOutcome::Complete, None, &target, session.rec))
            }
            Err(error) => {
                warn!(error = %error, "Rollout failed, rolling back");
                session.rec.enter(RolloutPhase::RollingBack, error.to_string());
                if matches!(
                    error,
                    PipelineError::HealthCheckFailed { .. } | PipelineError::HealthCheckTimeout { .. }
                ) {
                    target.health = HealthState::Unhealthy;
                }

                self.restore(&lease, &mut target, req.router.as_ref(), &mut session.rec.logs)
                    .await?;
                session.rec.enter(
                    RolloutPhase::RolledBack,
                    format!(
                        "restored {}",
                        prior_revision.as_deref().unwrap_or("empty target")
                    ),
                );

                let outcome = RolloutOutcome::RolledBack {
                    reason: error.to_string(),
                };
                Ok(report(rollout_id, &req, prior_revision, outcome, Some(error), &target, session.rec))
            }
        }
    }

    /// Roll back whatever is in flight on `target_name`.
    ///
    /// Returns `None` when nothing is in flight, which makes repeated calls
    /// harmless.
    #[instrument(skip(self, router))]
    pub async fn rollback(
        &self,
        target_name: &str,
        router: Option<Arc<dyn TrafficRouter>>,
    ) -> Result<Option<RolloutReport>> {
        let lease = self.targets.lock(target_name).await;
        let Some(mut target) = self.targets.load(target_name).await? else {
            return Ok(None);
        };
        let Some(in_flight) = target.in_flight.clone() else {
            info!("Nothing in flight, rollback is a no-op");
            return Ok(None);
        };

        let mut rec = Recorder::new(target_name);
        rec.enter(RolloutPhase::RollingBack, "rollback requested");
        self.restore(&lease, &mut target, router.as_ref(), &mut rec.logs).await?;
        rec.enter(
            RolloutPhase::RolledBack,
            format!(
                "restored {}",
                in_flight.prior_revision.as_deref().unwrap_or("empty target")
            ),
        );

        Ok(Some(RolloutReport {
            rollout_id: in_flight.rollout_id,
            target: target_name.to_string(),
            revision: in_flight.revision,
            prior_revision: in_flight.prior_revision,
            outcome: RolloutOutcome::RolledBack {
                reason: "rollback requested".to_string(),
            },
            transitions: rec.transitions,
            final_traffic: target.traffic.clone(),
            error: None,
            logs: rec.logs,
        }))
    }

    async fn advance(
        &self,
        lease: &TargetLease,
        target: &mut DeploymentTarget,
        s: &mut Session<'_>,
    ) -> Result<(), PipelineError> {
        let req = s.req;
        let checker = HealthChecker::new(req.probe.clone(), req.spec.verify.clone());
        let prior = target.current_revision.clone();
        let hosts = target.hosts.clone();
        let artifact_dir = req.artifact.as_ref().map(|a| a.location.clone());
        let new = HookTarget {
            target: &req.target,
            hooks: &req.spec.hooks,
            revision: &req.revision,
            artifact_dir: artifact_dir.as_deref(),
        };

        match req.spec.strategy {
            Strategy::BlueGreen => {
                s.rec.enter(
                    RolloutPhase::Provisioning,
                    format!("installing {} on {} hosts", req.revision, hosts.len()),
                );
                for host in &hosts {
                    self.install(&new, host, s).await?;
                }

                // A first deploy has nothing to shift away from
                let steps = if prior.is_some() {
                    req.spec.traffic.steps()
                } else {
                    vec![100]
                };

                for (i, percent) in steps.iter().copied().enumerate() {
                    if i > 0 {
                        guard(tokio::time::sleep(req.spec.traffic.interval()), s).await?;
                    }
                    let split = TrafficSplit::shifted(prior.as_deref(), &req.revision, percent);
                    s.rec.enter(RolloutPhase::TrafficShifting, split.render());
                    self.shift(lease, target, split, s).await?;

                    s.rec.enter(RolloutPhase::Verifying, format!("{}% on {}", percent, req.revision));
                    self.verify(&checker, hosts.clone(), s).await?;
                }
            }
            Strategy::Rolling => {
                let prior_dir = target.artifact_dir.clone();
                let old = prior.as_deref().map(|revision| HookTarget {
                    target: &req.target,
                    hooks: &req.spec.hooks,
                    revision,
                    artifact_dir: prior_dir.as_deref(),
                });

                let mut replaced: Vec<String> = Vec::new();
                for batch in hosts.chunks(req.spec.batch_size.max(1)) {
                    s.rec.enter(
                        RolloutPhase::Provisioning,
                        format!("replacing {}", batch.join(", ")),
                    );
                    for host in batch {
                        // Recorded before the host is touched so rollback covers a half-done host
                        if let Some(in_flight) = target.in_flight.as_mut() {
                            in_flight.replaced_hosts.push(host.clone());
                        }
                        self.targets
                            .save(lease, target)
                            .await
                            .map_err(PipelineError::storage)?;
                        replaced.push(host.clone());

                        if let Some(old) = &old {
                            self.hook(old, HookName::Stop, host, s).await?;
                        }
                        self.install(&new, host, s).await?;
                    }

                    let percent = (replaced.len() * 100 / hosts.len().max(1)) as u8;
                    let split = TrafficSplit::shifted(prior.as_deref(), &req.revision, percent);
                    s.rec.enter(RolloutPhase::TrafficShifting, split.render());
                    self.shift(lease, target, split, s).await?;

                    s.rec.enter(
                        RolloutPhase::Verifying,
                        format!("{} of {} hosts on {}", replaced.len(), hosts.len(), req.revision),
                    );
                    self.verify(&checker, replaced.clone(), s).await?;
                }
            }
        }

        Ok(())
    }

    async fn install(&self, on: &HookTarget<'_>, host: &str, s: &mut Session<'_>) -> Result<(), PipelineError> {
        for hook in INSTALL_SEQUENCE {
            self.hook(on, hook, host, s).await?;
        }
        Ok(())
    }

    /// Run one hook under the rollout's deadline and cancellation
    async fn hook(
        &self,
        on: &HookTarget<'_>,
        hook: HookName,
        host: &str,
        s: &mut Session<'_>,
    ) -> Result<(), PipelineError> {
        let mut logs = Vec::new();
        let result = guard(self.run_hook(on, hook, host, &mut logs), s).await;
        s.rec.logs.append(&mut logs);
        result?
    }

    async fn run_hook(
        &self,
        on: &HookTarget<'_>,
        hook: HookName,
        host: &str,
        logs: &mut Vec<LogLine>,
    ) -> Result<(), PipelineError> {
        let Some(spec) = on.hooks.get(hook) else {
            return Ok(());
        };

        let mut cmd = CommandSpec::new(&spec.path, spec.timeout())
            .env("CONVEYOR_HOST", host)
            .env("CONVEYOR_REVISION", on.revision)
            .env("CONVEYOR_TARGET", on.target)
            .env("CONVEYOR_HOOK", hook.as_str())
            .run_as(spec.run_as.clone());
        if let Some(dir) = on.artifact_dir {
            cmd = cmd
                .env("CONVEYOR_ARTIFACT", dir.display().to_string())
                .workdir(dir);
        }

        logs.push(LogLine::system(format!("{} {} on {}", hook, on.revision, host)));
        let failure = |reason: String| PipelineError::HookExecutionFailure {
            hook: hook.to_string(),
            host: host.to_string(),
            reason,
        };

        match self.runner.run(&cmd).await {
            Ok(output) => {
                logs.extend(LogLine::from_output(LogStream::Stdout, &output.stdout));
                logs.extend(LogLine::from_output(LogStream::Stderr, &output.stderr));
                if output.success() {
                    Ok(())
                } else {
                    Err(failure(format!("exit code {}", output.exit_code)))
                }
            }
            Err(RunnerError::TimedOut(after)) => Err(failure(format!("timed out after {}s", after.as_secs()))),
            Err(e) => Err(failure(e.to_string())),
        }
    }

    async fn shift(
        &self,
        lease: &TargetLease,
        target: &mut DeploymentTarget,
        split: TrafficSplit,
        s: &mut Session<'_>,
    ) -> Result<(), PipelineError> {
        if let Some(router) = &s.req.router {
            guard(router.apply(&target.name, &split), s)
                .await?
                .map_err(|e| PipelineError::TrafficShiftFailure {
                    target: target.name.clone(),
                    reason: e.to_string(),
                })?;
        }

        target.traffic = split;
        self.targets
            .save(lease, target)
            .await
            .map_err(PipelineError::storage)
    }

    async fn verify(&self, checker: &HealthChecker, hosts: Vec<String>, s: &mut Session<'_>) -> Result<(), PipelineError> {
        let outcome = checker.verify(hosts, s.deadline, s.cancel).await;
        match checker.failure_error(&outcome, &s.req.target, s.req.deadline_seconds()) {
            None => {
                s.rec.note(format!("verified: {:?}", outcome));
                Ok(())
            }
            Some(error) => Err(error),
        }
    }

    /// Stop the replaced revision after a blue/green cutover. Failures are logged only.
    async fn stop_old(
        &self,
        target: &DeploymentTarget,
        hooks: &DeploymentHooks,
        revision: &str,
        artifact_dir: Option<&Path>,
        rec: &mut Recorder,
    ) {
        let old = HookTarget {
            target: &target.name,
            hooks,
            revision,
            artifact_dir,
        };
        for host in &target.hosts {
            if let Err(e) = self.run_hook(&old, HookName::Stop, host, &mut rec.logs).await {
                warn!(host = %host, error = %e, "Failed to stop old revision");
                rec.note(format!("ignored: {}", e));
            }
        }
    }

    /// Undo the in-flight rollout on `target`. Every step is best effort
    /// except persisting the result.
    async fn restore(
        &self,
        lease: &TargetLease,
        target: &mut DeploymentTarget,
        router: Option<&Arc<dyn TrafficRouter>>,
        logs: &mut Vec<LogLine>,
    ) -> Result<bool> {
        let Some(in_flight) = target.in_flight.clone() else {
            return Ok(false);
        };

        if let Some(router) = router {
            if in_flight.prior_traffic.is_empty() {
                logs.push(LogLine::system("no prior traffic to restore"));
            } else if let Err(e) = router.apply(&target.name, &in_flight.prior_traffic).await {
                warn!(error = %e, "Failed to restore traffic weights");
                logs.push(LogLine::system(format!("traffic restore failed: {}", e)));
            }
        }

        let hosts = match in_flight.strategy {
            Strategy::BlueGreen => target.hosts.clone(),
            Strategy::Rolling => in_flight.replaced_hosts.clone(),
        };
        let new = HookTarget {
            target: &target.name,
            hooks: &in_flight.hooks,
            revision: &in_flight.revision,
            artifact_dir: in_flight.artifact_dir.as_deref(),
        };
        let old = in_flight.prior_revision.as_deref().map(|revision| HookTarget {
            target: &target.name,
            hooks: &in_flight.hooks,
            revision,
            artifact_dir: in_flight.prior_artifact_dir.as_deref(),
        });

        for host in &hosts {
            if let Err(e) = self.run_hook(&new, HookName::Stop, host, logs).await {
                warn!(host = %host, error = %e, "Failed to stop new revision");
            }

            if in_flight.strategy == Strategy::Rolling {
                if let Some(old) = &old {
                    for hook in INSTALL_SEQUENCE {
                        if let Err(e) = self.run_hook(old, hook, host, logs).await {
                            warn!(host = %host, error = %e, "Failed to reinstall prior revision");
                            break;
                        }
                    }
                }
            }
        }

        // The revision pointer only moves on promotion, so it still names the prior revision
        target.traffic = in_flight.prior_traffic;
        target.in_flight = None;
        self.targets.save(lease, target).await?;

        info!(target_name = %target.name, revision = ?target.current_revision, "Rolled back");
        Ok(true)
    }
}

/// Await `fut` unless the rollout is cancelled or its deadline passes first
async fn guard<T>(fut: impl Future<Output = T>, s: &Session<'_>) -> Result<T, PipelineError> {
    let far = Instant::now() + Duration::from_secs(365 * 24 * 3600);
    let deadline = tokio::time::sleep_until(s.deadline.unwrap_or(far));

    tokio::select! {
        biased;

        _ = s.cancel.cancelled() => Err(PipelineError::Cancelled),
        out = fut => Ok(out),
        _ = deadline => Err(PipelineError::DeployTimeout {
            target: s.req.target.clone(),
            timeout_seconds: s.req.deadline_seconds(),
        }),
    }
}

fn report(
    rollout_id: Uuid,
    req: &RolloutRequest,
    prior_revision: Option<String>,
    outcome: RolloutOutcome,
    error: Option<PipelineError>,
    target: &DeploymentTarget,
    rec: Recorder,
) -> RolloutReport {
    RolloutReport {
        rollout_id,
        target: req.target.clone(),
        revision: req.revision.clone(),
        prior_revision,
        outcome,
        transitions: rec.transitions,
        final_traffic: target.traffic.clone(),
        error,
        logs: rec.logs,
    }
}
