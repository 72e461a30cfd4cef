//! Failure taxonomy for pipeline runs and rollouts.
//!
//! Plumbing (I/O, parsing, configuration) uses `anyhow`. The variants here
//! are the failures the engine reasons about: whether a stage is retried,
//! whether a rollout is rolled back, and what the run's final status is.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure of a stage, hook, health check or notification.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    /// A command exited non-zero; the stage may be retried.
    #[error("Command `{command}` exited with code {exit_code}")]
    TransientStageFailure { command: String, exit_code: i32 },

    /// The stage kept failing after every allowed attempt.
    #[error("Stage '{stage}' failed after {attempts} attempts: {last_error}")]
    PermanentStageFailure {
        stage: String,
        attempts: u32,
        last_error: String,
    },

    /// The stage exceeded its timeout and was killed. Never retried.
    #[error("Stage '{stage}' timed out after {timeout_seconds}s")]
    StageTimeout { stage: String, timeout_seconds: u64 },

    /// Verification did not collect enough healthy polls in time.
    #[error("Health check timed out after {timeout_ms}ms with {healthy_streak} consecutive healthy polls")]
    HealthCheckTimeout { timeout_ms: u64, healthy_streak: u32 },

    /// A host reported unhealthy during verification.
    #[error("Host {host} unhealthy: {reason}")]
    HealthCheckFailed { host: String, reason: String },

    /// The overall deploy deadline expired.
    #[error("Deploy to '{target}' exceeded its deadline of {timeout_seconds}s")]
    DeployTimeout { target: String, timeout_seconds: u64 },

    /// A lifecycle hook exited non-zero or could not be executed.
    #[error("Hook {hook} failed on {host}: {reason}")]
    HookExecutionFailure {
        hook: String,
        host: String,
        reason: String,
    },

    /// Pushing traffic weights to the router failed.
    #[error("Traffic shift on '{target}' failed: {reason}")]
    TrafficShiftFailure { target: String, reason: String },

    /// A notification sink rejected an event. Never fatal to a run.
    #[error("Delivery to {sink} failed after {attempts} attempts: {reason}")]
    NotificationDeliveryFailure {
        sink: String,
        attempts: u32,
        reason: String,
    },

    /// The run was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// A deploy stage referenced a target the pipeline does not define.
    #[error("Unknown deployment target '{target}'")]
    UnknownTarget { target: String },

    /// Persisting state or artifacts failed.
    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl PipelineError {
    /// Whether the Stage Executor may retry after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStageFailure { .. })
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}
