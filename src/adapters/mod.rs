//! Adapter interfaces for external systems.
//!
//! The engine only talks to the outside world through these traits:
//! processes (stage commands and lifecycle hooks), health probes, traffic
//! routers, notification transports and log sinks. Vendor APIs live behind
//! implementations of them.

pub mod command;
pub mod http;
pub mod shell;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::domain::{LogLine, NotificationEvent, TrafficSplit};

pub use command::{CommandProbe, CommandRouter, CommandSink};
pub use http::{HttpProbe, WebhookSink};
pub use shell::ShellRunner;

/// A command to execute
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Shell command line
    pub command: String,

    /// Working directory
    pub workdir: Option<PathBuf>,

    /// Extra environment variables
    pub env: Vec<(String, String)>,

    /// Kill the process after this long
    pub timeout: Duration,

    /// Identity to run as
    pub run_as: Option<String>,

    /// Data written to stdin
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            workdir: None,
            env: Vec::new(),
            timeout,
            run_as: None,
            stdin: None,
        }
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn run_as(mut self, identity: Option<String>) -> Self {
        self.run_as = identity;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Why a command produced no exit status
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Failed to launch: {0}")]
    Launch(String),
}

/// Executes commands (stage steps, lifecycle hooks)
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Human-readable runner name
    fn name(&self) -> &str;

    /// Run a command to completion. A process that outlives
    /// `spec.timeout` is killed and `RunnerError::TimedOut` returned.
    async fn run(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, RunnerError>;
}

/// Result of probing one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Checks whether a host serves correctly
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Probe one host. Errors count as unhealthy.
    async fn probe(&self, host: &str) -> Result<HealthStatus>;
}

/// Pushes traffic weights to a load balancer
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, target: &str, split: &TrafficSplit) -> Result<()>;
}

/// Transport for terminal run notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &NotificationEvent) -> Result<()>;
}

/// Destination for stage logs
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, stage: &str, lines: &[LogLine]) -> Result<()>;
}

/// Notification sink that only logs; always succeeds
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        info!(run_id = %event.run_id, status = event.status.label(), "{}", event.summary());
        Ok(())
    }
}
