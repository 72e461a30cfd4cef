//! Stage results and log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use super::rollout::RolloutReport;
use crate::error::PipelineError;

/// Status of a stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started
    #[default]
    Pending,

    /// Currently executing (including between retries)
    Running,

    /// Completed successfully
    Succeeded,

    /// Failed permanently
    Failed,

    /// Deploy stage whose rollout was rolled back
    RolledBack,

    /// Not executed because an earlier stage did not succeed
    Skipped,
}

impl StageStatus {
    /// Whether the stage has reached a final, non-retrying state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Which stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by conveyor itself
    System,
}

/// A single line of stage output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

impl LogLine {
    pub fn new(stream: LogStream, line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            line: line.into(),
        }
    }

    pub fn system(line: impl Into<String>) -> Self {
        Self::new(LogStream::System, line)
    }

    /// Split captured process output into log lines
    pub fn from_output(stream: LogStream, output: &str) -> Vec<Self> {
        output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Self::new(stream, l))
            .collect()
    }

    /// Render as a single line of a log file
    pub fn render(&self) -> String {
        let tag = match self.stream {
            LogStream::Stdout => "out",
            LogStream::Stderr => "err",
            LogStream::System => "sys",
        };
        format!("{} [{}] {}", self.timestamp.to_rfc3339(), tag, self.line)
    }
}

/// Outcome of executing one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name (unique within pipeline)
    pub name: String,

    /// Final (or current) status
    pub status: StageStatus,

    /// Number of attempts made (0 if never started)
    pub attempts: u32,

    /// Failures of attempts that were retried, in order
    #[serde(default)]
    pub attempt_errors: Vec<PipelineError>,

    /// Captured output
    #[serde(default)]
    pub logs: Vec<LogLine>,

    /// Artifact produced by this stage
    pub output_artifact: Option<Artifact>,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Failure that ended the stage
    pub error: Option<PipelineError>,

    /// Rollout details for deploy stages
    pub rollout: Option<RolloutReport>,
}

impl StageResult {
    /// A stage that has not run yet
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            attempts: 0,
            attempt_errors: Vec::new(),
            logs: Vec::new(),
            output_artifact: None,
            duration_ms: None,
            error: None,
            rollout: None,
        }
    }

    pub fn with_status(mut self, status: StageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_error(mut self, error: PipelineError) -> Self {
        self.error = Some(error);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::RolledBack.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_log_lines_from_output_skip_blank_lines() {
        let lines = LogLine::from_output(LogStream::Stdout, "compiling\n\n  \nfinished\n");

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, "compiling");
        assert_eq!(lines[1].line, "finished");
        assert!(lines[1].render().contains("[out] finished"));
    }
}
