//! Shell command runner.
//!
//! Runs each command line through `sh -c`, optionally under another identity
//! via `sudo -n -u`. The child is killed when its timeout expires or when the
//! caller drops the future (cancellation).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{CommandOutput, CommandRunner, CommandSpec, RunnerError};

/// Runs commands as local subprocesses
pub struct ShellRunner {
    /// Shell binary (default: "sh")
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    fn build_command(&self, spec: &CommandSpec) -> Command {
        let current_user = std::env::var("USER").ok();
        let mut command = match spec.run_as {
            Some(ref identity) if current_user.as_deref() != Some(identity.as_str()) => {
                let mut cmd = Command::new("sudo");
                cmd.args([
                    "-n",
                    "-E",
                    "-u",
                    identity.as_str(),
                    "--",
                    self.shell.as_str(),
                    "-c",
                    spec.command.as_str(),
                ]);
                cmd
            }
            _ => {
                let mut cmd = Command::new(&self.shell);
                cmd.args(["-c", spec.command.as_str()]);
                cmd
            }
        };

        if let Some(ref dir) = spec.workdir {
            command.current_dir(dir);
        }
        command
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    fn name(&self) -> &str {
        "shell"
    }

    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        debug!(command = %spec.command, timeout_ms = spec.timeout.as_millis() as u64, "Spawning command");

        let mut child = self
            .build_command(spec)
            .spawn()
            .map_err(|e| RunnerError::Launch(format!("{}: {}", spec.command, e)))?;

        // Stdin is fed alongside the wait, so a child that never reads it
        // still runs into the timeout
        let stdin = child.stdin.take();
        let feed = async {
            let (Some(input), Some(mut stdin)) = (spec.stdin.as_ref(), stdin) else {
                return Ok(());
            };
            match stdin.write_all(input.as_bytes()).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    Err(RunnerError::Launch(format!("failed to write stdin: {}", e)))
                }
                // Dropping stdin signals EOF
                _ => Ok(()),
            }
        };

        // On timeout the future is dropped, and kill_on_drop reaps the child
        let (fed, output) = timeout(spec.timeout, async { tokio::join!(feed, child.wait_with_output()) })
            .await
            .map_err(|_| RunnerError::TimedOut(spec.timeout))?;
        fed?;
        let output =
            output.map_err(|e| RunnerError::Launch(format!("failed to wait for {}: {}", spec.command, e)))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let runner = ShellRunner::new();
        let spec = CommandSpec::new("echo built; echo warn >&2; exit 3", Duration::from_secs(5));

        let output = runner.run(&spec).await.unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "built");
        assert_eq!(output.stderr.trim(), "warn");
    }

    #[tokio::test]
    async fn test_env_and_stdin() {
        let runner = ShellRunner::new();
        let spec = CommandSpec::new("read line; echo \"$GREETING $line\"", Duration::from_secs(5))
            .env("GREETING", "hello")
            .stdin("world\n");

        let output = runner.run(&spec).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello world");
    }

    #[tokio::test]
    async fn test_unread_stdin_is_bounded_by_timeout() {
        let runner = ShellRunner::new();
        // Larger than any pipe buffer, and the command never reads it
        let payload = "x".repeat(4 * 1024 * 1024);
        let spec = CommandSpec::new("sleep 5", Duration::from_millis(200)).stdin(payload);

        let started = std::time::Instant::now();
        let result = runner.run(&spec).await;
        assert!(matches!(result, Err(RunnerError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let runner = ShellRunner::new();
        let spec = CommandSpec::new("sleep 5", Duration::from_millis(100));

        let result = runner.run(&spec).await;
        assert!(matches!(result, Err(RunnerError::TimedOut(_))));
    }
}
