//! In-memory fakes of the adapter traits shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Barrier;

use conveyor::adapters::{
    CommandOutput, CommandRunner, CommandSpec, HealthProbe, HealthStatus, NotificationSink, RunnerError,
    TrafficRouter,
};
use conveyor::domain::{NotificationEvent, TrafficSplit};

/// What a scripted command does when run
#[derive(Debug, Clone)]
pub enum Outcome {
    Exit(i32),
    TimedOut,
    /// Sleep, then exit 0
    Sleep(Duration),
}

/// Runs nothing; answers from per-command scripts (default: exit 0)
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    calls: Mutex<Vec<CommandSpec>>,
    barrier: Mutex<Option<(String, Arc<Barrier>)>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, command: &str, outcomes: Vec<Outcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(command.to_string(), outcomes.into_iter().collect());
    }

    /// Every run of `command` waits at `barrier` first
    pub fn gate(&self, command: &str, barrier: Arc<Barrier>) {
        *self.barrier.lock().unwrap() = Some((command.to_string(), barrier));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| c.command == command).count()
    }

    /// `(hook, host, revision)` for every lifecycle hook run, in order
    pub fn hooks(&self) -> Vec<(String, String, String)> {
        self.calls()
            .iter()
            .filter_map(|c| {
                Some((
                    env(c, "CONVEYOR_HOOK")?.to_string(),
                    env(c, "CONVEYOR_HOST")?.to_string(),
                    env(c, "CONVEYOR_REVISION")?.to_string(),
                ))
            })
            .collect()
    }
}

pub fn env<'a>(spec: &'a CommandSpec, key: &str) -> Option<&'a str> {
    spec.env
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, RunnerError> {
        self.calls.lock().unwrap().push(spec.clone());

        let gate = self.barrier.lock().unwrap().clone();
        if let Some((command, barrier)) = gate {
            if command == spec.command {
                barrier.wait().await;
            }
        }

        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&spec.command)
            .and_then(|script| script.pop_front())
            .unwrap_or(Outcome::Exit(0));

        match outcome {
            Outcome::Exit(exit_code) => Ok(CommandOutput {
                exit_code,
                stdout: format!("ran {}\n", spec.command),
                stderr: if exit_code == 0 {
                    String::new()
                } else {
                    format!("exit {}\n", exit_code)
                },
            }),
            Outcome::TimedOut => Err(RunnerError::TimedOut(spec.timeout)),
            Outcome::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(CommandOutput::default())
            }
        }
    }
}

/// Health probe whose answer can be flipped at any time
pub struct SwitchProbe {
    healthy: AtomicBool,
    probes: AtomicU32,
    hosts: Mutex<Vec<String>>,
}

impl SwitchProbe {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            probes: AtomicU32::new(0),
            hosts: Mutex::new(Vec::new()),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn probed_hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthProbe for SwitchProbe {
    fn name(&self) -> &str {
        "switch"
    }

    async fn probe(&self, host: &str) -> Result<HealthStatus> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.hosts.lock().unwrap().push(host.to_string());
        if self.healthy.load(Ordering::SeqCst) {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy {
                reason: "HTTP 503".to_string(),
            })
        }
    }
}

/// Remembers every split it was asked to apply
#[derive(Default)]
pub struct RecordingRouter {
    applied: Mutex<Vec<(String, TrafficSplit)>>,
}

impl RecordingRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|(_, split)| split.render())
            .collect()
    }
}

#[async_trait]
impl TrafficRouter for RecordingRouter {
    fn name(&self) -> &str {
        "recording"
    }

    async fn apply(&self, target: &str, split: &TrafficSplit) -> Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push((target.to_string(), split.clone()));
        Ok(())
    }
}

/// Keeps every delivered event
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Fails every delivery
#[derive(Default)]
pub struct BrokenSink {
    calls: AtomicU32,
}

impl BrokenSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for BrokenSink {
    fn name(&self) -> &str {
        "broken"
    }

    async fn deliver(&self, _event: &NotificationEvent) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("503 Service Unavailable")
    }
}
