//! Rollout Controller Integration Tests
//!
//! Blue/green and rolling deploys against scripted hooks, a switchable
//! health probe and a recording traffic router.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::Barrier;
use uuid::Uuid;

use common::{Outcome, RecordingRouter, ScriptedRunner, SwitchProbe};
use conveyor::core::{CancellationToken, DeploySpec, RolloutController, RolloutRequest, TargetStore};
use conveyor::domain::{HealthState, InFlightRollout, RolloutOutcome, RolloutPhase, Strategy, TrafficSplit};
use conveyor::PipelineError;

const HOOKS: &str = r#"
hooks:
  pre_install: { path: pre }
  post_install: { path: post }
  start: { path: start }
  stop: { path: stop }
"#;

fn spec(extra: &str) -> DeploySpec {
    let yaml = format!(
        "target: web\nverify: {{ healthy_threshold: 1, poll_interval_ms: 5, timeout_ms: 2000 }}\n{}{}",
        extra, HOOKS
    );
    serde_yaml::from_str(&yaml).unwrap()
}

fn blue_green() -> DeploySpec {
    spec("strategy: blue_green\ntraffic: { step_percent: 50, interval_ms: 0 }\n")
}

fn rolling(batch_size: usize) -> DeploySpec {
    spec(&format!("strategy: rolling\nbatch_size: {}\n", batch_size))
}

fn hosts(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("h{}", i)).collect()
}

struct Harness {
    _dir: TempDir,
    runner: Arc<ScriptedRunner>,
    router: Arc<RecordingRouter>,
    probe: Arc<SwitchProbe>,
    controller: Arc<RolloutController>,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let targets = Arc::new(TargetStore::new(dir.path().join("targets")));
    Harness {
        controller: Arc::new(RolloutController::new(targets, runner.clone())),
        _dir: dir,
        runner,
        router: RecordingRouter::new(),
        probe: SwitchProbe::healthy(),
    }
}

impl Harness {
    fn request(&self, target: &str, hosts: Vec<String>, revision: &str, mut spec: DeploySpec) -> RolloutRequest {
        spec.target = target.to_string();
        RolloutRequest {
            run_id: Uuid::new_v4(),
            target: target.to_string(),
            hosts,
            revision: revision.to_string(),
            artifact: None,
            spec,
            deadline: Some(Duration::from_secs(30)),
            probe: self.probe.clone(),
            router: Some(self.router.clone()),
        }
    }

    async fn deploy(&self, revision: &str, spec: DeploySpec, hosts: Vec<String>) -> conveyor::domain::RolloutReport {
        let req = self.request("web", hosts, revision, spec);
        self.controller.deploy(req, &CancellationToken::new()).await.unwrap()
    }

    fn hooks(&self) -> Vec<(String, String, String)> {
        self.runner.hooks()
    }
}

fn hook(name: &str, host: &str, revision: &str) -> (String, String, String) {
    (name.to_string(), host.to_string(), revision.to_string())
}

#[tokio::test]
async fn test_first_blue_green_deploy() {
    let h = harness();

    let report = h.deploy("v1", blue_green(), hosts(2)).await;

    assert_eq!(report.outcome, RolloutOutcome::Complete);
    assert_eq!(
        report.phases(),
        vec![
            RolloutPhase::Provisioning,
            RolloutPhase::TrafficShifting,
            RolloutPhase::Verifying,
            RolloutPhase::Complete,
        ]
    );
    assert_eq!(
        h.hooks(),
        vec![
            hook("pre_install", "h1", "v1"),
            hook("post_install", "h1", "v1"),
            hook("start", "h1", "v1"),
            hook("pre_install", "h2", "v1"),
            hook("post_install", "h2", "v1"),
            hook("start", "h2", "v1"),
        ]
    );
    // Nothing to shift away from on an empty target
    assert_eq!(h.router.applied(), vec!["v1=100"]);

    let target = h.controller.targets().load("web").await.unwrap().unwrap();
    assert_eq!(target.current_revision.as_deref(), Some("v1"));
    assert_eq!(target.traffic, TrafficSplit::single("v1"));
    assert_eq!(target.health, HealthState::Healthy);
    assert!(target.in_flight.is_none());
}

#[tokio::test]
async fn test_blue_green_shifts_in_steps_then_stops_old() {
    let h = harness();
    h.deploy("v1", blue_green(), hosts(2)).await;

    let report = h.deploy("v2", blue_green(), hosts(2)).await;

    assert_eq!(report.outcome, RolloutOutcome::Complete);
    assert_eq!(report.prior_revision.as_deref(), Some("v1"));
    assert_eq!(h.router.applied(), vec!["v1=100", "v1=50,v2=50", "v2=100"]);

    let hooks = h.hooks();
    assert_eq!(hooks[hooks.len() - 2..], [hook("stop", "h1", "v1"), hook("stop", "h2", "v1")]);

    let target = h.controller.targets().load("web").await.unwrap().unwrap();
    assert_eq!(target.current_revision.as_deref(), Some("v2"));
    assert_eq!(target.previous_revision.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_unhealthy_step_rolls_back_to_prior_revision() {
    let h = harness();
    h.deploy("v1", blue_green(), hosts(2)).await;
    h.probe.set_healthy(false);

    let report = h.deploy("v2", blue_green(), hosts(2)).await;

    assert!(report.is_rolled_back());
    assert_eq!(
        report.phases(),
        vec![
            RolloutPhase::Provisioning,
            RolloutPhase::TrafficShifting,
            RolloutPhase::Verifying,
            RolloutPhase::RollingBack,
            RolloutPhase::RolledBack,
        ]
    );
    assert_eq!(report.transitions[1].detail, "v1=50,v2=50");
    assert!(matches!(report.error, Some(PipelineError::HealthCheckFailed { .. })));
    assert_eq!(report.final_traffic, TrafficSplit::single("v1"));
    assert_eq!(h.router.applied().last().map(String::as_str), Some("v1=100"));

    let hooks = h.hooks();
    assert!(hooks.contains(&hook("stop", "h1", "v2")));
    assert!(hooks.contains(&hook("stop", "h2", "v2")));

    let target = h.controller.targets().load("web").await.unwrap().unwrap();
    assert_eq!(target.current_revision.as_deref(), Some("v1"));
    assert_eq!(target.health, HealthState::Unhealthy);
    assert!(target.in_flight.is_none());
}

#[tokio::test]
async fn test_hook_failure_rolls_back_first_deploy() {
    let h = harness();
    h.runner.script("start", vec![Outcome::Exit(1)]);

    let report = h.deploy("v1", blue_green(), hosts(2)).await;

    assert!(report.is_rolled_back());
    match report.error {
        Some(PipelineError::HookExecutionFailure { hook, host, .. }) => {
            assert_eq!(hook, "start");
            assert_eq!(host, "h1");
        }
        other => panic!("expected hook failure, got {:?}", other),
    }
    // Host h2 was never installed
    assert!(!h.hooks().contains(&hook("pre_install", "h2", "v1")));
    assert!(h.router.applied().is_empty());

    let target = h.controller.targets().load("web").await.unwrap().unwrap();
    assert!(target.current_revision.is_none());
    assert!(target.traffic.is_empty());
    assert!(target.in_flight.is_none());
}

#[tokio::test]
async fn test_already_current_runs_nothing() {
    let h = harness();
    h.deploy("v1", blue_green(), hosts(2)).await;
    let calls = h.runner.calls().len();

    let report = h.deploy("v1", blue_green(), hosts(2)).await;

    assert_eq!(report.outcome, RolloutOutcome::AlreadyCurrent);
    assert_eq!(report.phases(), vec![RolloutPhase::Complete]);
    assert_eq!(h.runner.calls().len(), calls);
}

#[tokio::test]
async fn test_cancelled_rollout_rolls_back() {
    let h = harness();
    h.deploy("v1", blue_green(), hosts(2)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let req = h.request("web", hosts(2), "v2", blue_green());
    let report = h.controller.deploy(req, &cancel).await.unwrap();

    assert!(report.is_rolled_back());
    assert_eq!(report.error, Some(PipelineError::Cancelled));

    let target = h.controller.targets().load("web").await.unwrap().unwrap();
    assert_eq!(target.current_revision.as_deref(), Some("v1"));
    assert_eq!(target.traffic, TrafficSplit::single("v1"));
}

#[tokio::test]
async fn test_deadline_exceeded_rolls_back() {
    let h = harness();
    h.runner
        .script("start", vec![Outcome::Sleep(Duration::from_secs(10))]);

    let mut req = h.request("web", hosts(1), "v1", blue_green());
    req.deadline = Some(Duration::from_millis(50));
    let report = h.controller.deploy(req, &CancellationToken::new()).await.unwrap();

    assert!(report.is_rolled_back());
    assert!(matches!(report.error, Some(PipelineError::DeployTimeout { .. })));
}

#[tokio::test]
async fn test_rollback_without_rollout_is_noop() {
    let h = harness();

    assert!(h.controller.rollback("web", None).await.unwrap().is_none());

    h.deploy("v1", blue_green(), hosts(2)).await;
    assert!(h.controller.rollback("web", None).await.unwrap().is_none());
    assert!(h.controller.rollback("web", None).await.unwrap().is_none());

    let target = h.controller.targets().load("web").await.unwrap().unwrap();
    assert_eq!(target.current_revision.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_rollback_of_interrupted_rollout() {
    let h = harness();
    h.deploy("v1", blue_green(), hosts(2)).await;

    // Leave a half-shifted rollout behind, as a crash would
    {
        let store = h.controller.targets();
        let lease = store.lock("web").await;
        let mut target = store.load("web").await.unwrap().unwrap();
        target.traffic = TrafficSplit::shifted(Some("v1"), "v2", 50);
        target.in_flight = Some(InFlightRollout {
            rollout_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            revision: "v2".to_string(),
            prior_revision: Some("v1".to_string()),
            prior_traffic: TrafficSplit::single("v1"),
            strategy: Strategy::BlueGreen,
            hooks: blue_green().hooks,
            artifact_dir: None,
            prior_artifact_dir: None,
            replaced_hosts: Vec::new(),
            started_at: Utc::now(),
        });
        store.save(&lease, &mut target).await.unwrap();
    }

    let router: Arc<dyn conveyor::adapters::TrafficRouter> = h.router.clone();
    let report = h.controller.rollback("web", Some(router)).await.unwrap().unwrap();

    assert_eq!(report.revision, "v2");
    assert_eq!(report.final_phase(), RolloutPhase::RolledBack);
    assert_eq!(report.final_traffic, TrafficSplit::single("v1"));
    assert_eq!(h.router.applied().last().map(String::as_str), Some("v1=100"));
    assert!(h.hooks().contains(&hook("stop", "h1", "v2")));

    let target = h.controller.targets().load("web").await.unwrap().unwrap();
    assert_eq!(target.current_revision.as_deref(), Some("v1"));
    assert!(target.in_flight.is_none());

    assert!(h.controller.rollback("web", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rolling_replaces_hosts_in_batches() {
    let h = harness();
    h.deploy("v1", rolling(2), hosts(4)).await;
    let before = h.hooks().len();
    let probe = SwitchProbe::healthy();

    let mut req = h.request("web", hosts(4), "v2", rolling(2));
    req.probe = probe.clone();
    let report = h.controller.deploy(req, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.outcome, RolloutOutcome::Complete);
    assert_eq!(
        h.router.applied()[2..],
        ["v1=50,v2=50".to_string(), "v2=100".to_string()]
    );

    let hooks = h.hooks()[before..].to_vec();
    assert_eq!(
        hooks[..4],
        [
            hook("stop", "h1", "v1"),
            hook("pre_install", "h1", "v2"),
            hook("post_install", "h1", "v2"),
            hook("start", "h1", "v2"),
        ]
    );
    assert_eq!(hooks.len(), 16);

    // The first verification covers only the first batch
    let mut first_round = probe.probed_hosts()[..2].to_vec();
    first_round.sort();
    assert_eq!(first_round, vec!["h1", "h2"]);
}

#[tokio::test]
async fn test_rolling_failure_reinstalls_prior_on_replaced_hosts() {
    let h = harness();
    h.deploy("v1", rolling(2), hosts(4)).await;
    let before = h.hooks().len();
    h.probe.set_healthy(false);

    let report = h.deploy("v2", rolling(2), hosts(4)).await;

    assert!(report.is_rolled_back());
    let hooks = h.hooks()[before..].to_vec();
    for host in ["h1", "h2"] {
        assert!(hooks.contains(&hook("stop", host, "v2")));
        assert!(hooks.contains(&hook("start", host, "v1")));
    }
    assert!(!hooks.iter().any(|(_, host, _)| host == "h3" || host == "h4"));

    let target = h.controller.targets().load("web").await.unwrap().unwrap();
    assert_eq!(target.current_revision.as_deref(), Some("v1"));
    assert_eq!(target.traffic, TrafficSplit::single("v1"));
}

#[tokio::test]
async fn test_same_target_rollouts_are_serialized() {
    let h = harness();
    let lease = h.controller.targets().lock("web").await;

    let controller = h.controller.clone();
    let req = h.request("web", hosts(1), "v1", blue_green());
    let task = tokio::spawn(async move { controller.deploy(req, &CancellationToken::new()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert!(h.runner.calls().is_empty());

    drop(lease);
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.outcome, RolloutOutcome::Complete);
}

#[tokio::test]
async fn test_disjoint_targets_roll_out_concurrently() {
    let h = harness();
    // Each rollout's start hook waits for the other one
    h.runner.gate("start", Arc::new(Barrier::new(2)));

    let mut tasks = Vec::new();
    for target in ["web", "api"] {
        let controller = h.controller.clone();
        let req = h.request(target, hosts(1), "v1", blue_green());
        tasks.push(tokio::spawn(async move { controller.deploy(req, &CancellationToken::new()).await }));
    }

    let reports = tokio::time::timeout(Duration::from_secs(5), async {
        let mut reports = Vec::new();
        for task in tasks {
            reports.push(task.await.unwrap().unwrap());
        }
        reports
    })
    .await
    .expect("rollouts on different targets must not block each other");

    assert!(reports.iter().all(|r| r.outcome == RolloutOutcome::Complete));
}
