//! Adapters that delegate to external commands.
//!
//! Vendor CLIs (load balancer tools, mailers, queue clients, custom health
//! scripts) plug in here without the engine knowing their API surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{CommandRunner, CommandSpec, HealthProbe, HealthStatus, NotificationSink, TrafficRouter};
use crate::domain::{NotificationEvent, TrafficSplit};

/// Health probe that runs a command; exit code 0 is healthy.
///
/// The host is passed as `CONVEYOR_HOST`.
pub struct CommandProbe {
    runner: Arc<dyn CommandRunner>,
    command: String,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    fn name(&self) -> &str {
        "command"
    }

    async fn probe(&self, host: &str) -> Result<HealthStatus> {
        let spec = CommandSpec::new(&self.command, self.timeout).env("CONVEYOR_HOST", host);
        let output = self
            .runner
            .run(&spec)
            .await
            .with_context(|| format!("Health command failed for {}", host))?;

        if output.success() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy {
                reason: format!(
                    "health command exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            })
        }
    }
}

/// Traffic router that runs a command with the weights in
/// `CONVEYOR_TRAFFIC` (`rev=pct,...`) and the target in `CONVEYOR_TARGET`.
pub struct CommandRouter {
    runner: Arc<dyn CommandRunner>,
    command: String,
    timeout: Duration,
}

impl CommandRouter {
    pub fn new(runner: Arc<dyn CommandRunner>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TrafficRouter for CommandRouter {
    fn name(&self) -> &str {
        "command"
    }

    async fn apply(&self, target: &str, split: &TrafficSplit) -> Result<()> {
        let spec = CommandSpec::new(&self.command, self.timeout)
            .env("CONVEYOR_TARGET", target)
            .env("CONVEYOR_TRAFFIC", split.render());
        let output = self
            .runner
            .run(&spec)
            .await
            .with_context(|| format!("Traffic command failed for {}", target))?;

        if !output.success() {
            anyhow::bail!(
                "Traffic command exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

/// Notification sink that writes the event JSON to a command's stdin
pub struct CommandSink {
    runner: Arc<dyn CommandRunner>,
    command: String,
    timeout: Duration,
}

impl CommandSink {
    pub fn new(runner: Arc<dyn CommandRunner>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl NotificationSink for CommandSink {
    fn name(&self) -> &str {
        &self.command
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let body = serde_json::to_string(event).context("Failed to serialize notification")?;
        let spec = CommandSpec::new(&self.command, self.timeout)
            .env("CONVEYOR_RUN_ID", event.run_id.to_string())
            .env("CONVEYOR_STATUS", event.status.label())
            .env("CONVEYOR_SUMMARY", event.summary())
            .stdin(body);

        let output = self
            .runner
            .run(&spec)
            .await
            .with_context(|| format!("Notification command '{}' failed", self.command))?;

        if !output.success() {
            anyhow::bail!(
                "Notification command exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ShellRunner;

    #[tokio::test]
    async fn test_command_probe_uses_exit_code() {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
        let probe = CommandProbe::new(
            runner,
            "test \"$CONVEYOR_HOST\" = good",
            Duration::from_secs(5),
        );

        assert_eq!(probe.probe("good").await.unwrap(), HealthStatus::Healthy);
        assert!(!probe.probe("bad").await.unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_command_router_receives_weights() {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
        let router = CommandRouter::new(
            runner,
            "test \"$CONVEYOR_TRAFFIC\" = \"v1=50,v2=50\"",
            Duration::from_secs(5),
        );

        let split = TrafficSplit::shifted(Some("v1"), "v2", 50);
        assert!(router.apply("prod", &split).await.is_ok());

        let split = TrafficSplit::single("v2");
        assert!(router.apply("prod", &split).await.is_err());
    }
}
