//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML and consist of deployment targets and
//! ordered stages. A stage either runs shell commands (source fetch, build,
//! test) or, when it carries a `deploy` section, rolls a revision out to a
//! target.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use super::notifier::NotificationSettings;
use crate::adapters::{CommandProbe, CommandRouter, CommandRunner, HealthProbe, HttpProbe, TrafficRouter};
use crate::domain::{DeploymentHooks, Strategy};

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Deployment targets referenced by deploy stages
    #[serde(default)]
    pub targets: BTreeMap<String, TargetDef>,

    /// Subscribers for this pipeline's runs, replacing the configured ones
    #[serde(default)]
    pub notifications: Option<NotificationSettings>,

    /// Ordered list of stages to execute
    pub stages: Vec<StageDef>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file, filling unset rollout settings from `defaults`
    pub fn from_file(path: &Path, defaults: &RolloutDefaults) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml_with(&content, defaults)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Parse a pipeline, seeding every deploy stage with `defaults` for the
    /// keys it leaves out
    pub fn from_yaml_with(content: &str, defaults: &RolloutDefaults) -> Result<Self> {
        let mut doc: Value = serde_yaml::from_str(content).context("Failed to parse pipeline YAML")?;
        let seed = serde_yaml::to_value(defaults).context("Failed to encode rollout defaults")?;

        if let Some(stages) = doc.get_mut("stages").and_then(Value::as_sequence_mut) {
            for stage in stages {
                if let Some(deploy) = stage.get_mut("deploy") {
                    fill_missing(deploy, &seed);
                }
            }
        }

        serde_yaml::from_value(doc).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        check_name("Pipeline", &self.name)?;

        if self.stages.is_empty() {
            anyhow::bail!("Pipeline must have at least one stage");
        }

        for (name, target) in &self.targets {
            check_name("Target", name)?;
            if target.hosts.is_empty() {
                anyhow::bail!("Target '{}' has no hosts", name);
            }
        }

        let mut seen = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            check_name("Stage", &stage.name).with_context(|| format!("Invalid stage {}", i))?;
            if !seen.insert(stage.name.as_str()) {
                anyhow::bail!("Duplicate stage name '{}'", stage.name);
            }
            if stage.timeout_seconds == 0 {
                anyhow::bail!("Stage '{}' has a zero timeout", stage.name);
            }

            match stage.deploy {
                Some(ref deploy) => {
                    if !stage.commands.is_empty() {
                        anyhow::bail!(
                            "Stage '{}' is a deploy stage and cannot also run commands",
                            stage.name
                        );
                    }
                    if !self.targets.contains_key(&deploy.target) {
                        anyhow::bail!(
                            "Stage '{}' deploys to undefined target '{}'",
                            stage.name,
                            deploy.target
                        );
                    }
                    deploy
                        .validate()
                        .with_context(|| format!("Invalid deploy settings in stage '{}'", stage.name))?;
                }
                None => {
                    if stage.commands.is_empty() {
                        anyhow::bail!("Stage '{}' has no commands", stage.name);
                    }
                }
            }
        }

        Ok(())
    }

    /// Get a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage names in declared order
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }
}

/// Copy the keys of `defaults` that `value` lacks, merging nested mappings
fn fill_missing(value: &mut Value, defaults: &Value) {
    let (Some(map), Some(defaults)) = (value.as_mapping_mut(), defaults.as_mapping()) else {
        return;
    };
    for (key, default) in defaults {
        match map.get_mut(key) {
            Some(existing) => fill_missing(existing, default),
            None => {
                map.insert(key.clone(), default.clone());
            }
        }
    }
}

/// Names become file names (stage logs, target records), so they are
/// limited to `[A-Za-z0-9._-]` and may not be `.` or `..`.
pub fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} name cannot be empty", kind);
    }
    if name == "." || name == ".." {
        anyhow::bail!("{} name '{}' is reserved", kind, name);
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        anyhow::bail!("{} name '{}' contains '{}'", kind, name, c);
    }
    Ok(())
}

/// A single stage in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    /// Stage name (unique within pipeline)
    pub name: String,

    /// Shell commands run in order
    #[serde(default)]
    pub commands: Vec<String>,

    /// Timeout for one attempt in seconds
    #[serde(default = "default_stage_timeout")]
    pub timeout_seconds: u64,

    /// Extra attempts after a non-zero exit
    #[serde(default)]
    pub retry_count: u32,

    /// Delay between attempts
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Extra environment variables for the commands
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Files to store as this stage's output artifact
    pub artifacts: Option<ArtifactSpec>,

    /// Rollout settings; present only on deploy stages
    pub deploy: Option<DeploySpec>,
}

fn default_stage_timeout() -> u64 {
    300
}

impl StageDef {
    /// Get the timeout for one attempt
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Upper bound on attempts: the first try plus every retry
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// Output files of a stage, as globs relative to the workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub files: Vec<String>,
}

/// A set of hosts plus how to check and route them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDef {
    pub hosts: Vec<String>,

    #[serde(default)]
    pub health: HealthProbeSpec,

    /// Command that applies traffic weights (`CONVEYOR_TRAFFIC=rev=pct,...`)
    pub traffic_command: Option<String>,
}

impl TargetDef {
    /// Health probe described by `health`
    pub fn probe(&self, runner: Arc<dyn CommandRunner>) -> Result<Arc<dyn HealthProbe>> {
        let probe: Arc<dyn HealthProbe> = match &self.health {
            HealthProbeSpec::Http {
                scheme,
                port,
                path,
                timeout_ms,
            } => Arc::new(HttpProbe::new(
                scheme.as_str(),
                *port,
                path.as_str(),
                Duration::from_millis(*timeout_ms),
            )?),
            HealthProbeSpec::Command { command, timeout_ms } => Arc::new(CommandProbe::new(
                runner,
                command.as_str(),
                Duration::from_millis(*timeout_ms),
            )),
        };
        Ok(probe)
    }

    /// Traffic router, when the target has a traffic command
    pub fn router(&self, runner: Arc<dyn CommandRunner>) -> Option<Arc<dyn TrafficRouter>> {
        self.traffic_command.as_ref().map(|command| {
            Arc::new(CommandRouter::new(runner, command.as_str(), Duration::from_secs(60))) as Arc<dyn TrafficRouter>
        })
    }
}

/// How hosts of a target are probed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthProbeSpec {
    Http {
        #[serde(default = "default_scheme")]
        scheme: String,
        #[serde(default = "default_port")]
        port: u16,
        #[serde(default = "default_health_path")]
        path: String,
        #[serde(default = "default_probe_timeout")]
        timeout_ms: u64,
    },
    Command {
        command: String,
        #[serde(default = "default_probe_timeout")]
        timeout_ms: u64,
    },
}

fn default_scheme() -> String {
    "http".to_string()
}
fn default_port() -> u16 {
    80
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_probe_timeout() -> u64 {
    2000
}

impl Default for HealthProbeSpec {
    fn default() -> Self {
        Self::Http {
            scheme: default_scheme(),
            port: default_port(),
            path: default_health_path(),
            timeout_ms: default_probe_timeout(),
        }
    }
}

/// Rollout settings for a deploy stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySpec {
    /// Name of a target in `Pipeline::targets`
    pub target: String,

    #[serde(default)]
    pub strategy: Strategy,

    /// Hosts replaced per batch (rolling only)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Revision to deploy (defaults to the trigger's source revision)
    pub revision: Option<String>,

    #[serde(default)]
    pub traffic: TrafficShiftConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub hooks: DeploymentHooks,
}

fn default_batch_size() -> usize {
    1
}

impl DeploySpec {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        self.traffic.validate()?;
        self.verify.validate()
    }
}

/// Rollout settings used by deploy stages that do not set their own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutDefaults {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub traffic: TrafficShiftConfig,

    #[serde(default)]
    pub verify: VerifyConfig,
}

impl Default for RolloutDefaults {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            traffic: TrafficShiftConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl RolloutDefaults {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        self.traffic.validate()?;
        self.verify.validate()
    }
}

/// How traffic moves to the new revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficShiftConfig {
    /// Percentage moved per step (1-100)
    #[serde(default = "default_step_percent")]
    pub step_percent: u8,

    /// Pause between steps in milliseconds
    #[serde(default = "default_step_interval")]
    pub interval_ms: u64,
}

fn default_step_percent() -> u8 {
    25
}
fn default_step_interval() -> u64 {
    30_000
}

impl Default for TrafficShiftConfig {
    fn default() -> Self {
        Self {
            step_percent: default_step_percent(),
            interval_ms: default_step_interval(),
        }
    }
}

impl TrafficShiftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_percent == 0 || self.step_percent > 100 {
            anyhow::bail!("step_percent must be between 1 and 100, got {}", self.step_percent);
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Cumulative percentages, always ending at 100
    pub fn steps(&self) -> Vec<u8> {
        let step = self.step_percent.clamp(1, 100) as u16;
        let mut steps: Vec<u8> = (1..)
            .map(|i| i * step)
            .take_while(|p| *p < 100)
            .map(|p| p as u8)
            .collect();
        steps.push(100);
        steps
    }
}

/// Health verification after each shift
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Consecutive healthy polls required to advance
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Time between polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Give up on a verification after this many milliseconds
    #[serde(default = "default_verify_timeout")]
    pub timeout_ms: u64,
}

fn default_healthy_threshold() -> u32 {
    3
}
fn default_poll_interval() -> u64 {
    5_000
}
fn default_verify_timeout() -> u64 {
    120_000
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: default_healthy_threshold(),
            poll_interval_ms: default_poll_interval(),
            timeout_ms: default_verify_timeout(),
        }
    }
}

impl VerifyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.healthy_threshold == 0 {
            anyhow::bail!("healthy_threshold must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("verify timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backoff between retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No delay at all (tests, local runs)
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}
