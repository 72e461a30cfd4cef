//! Pipeline run state and reconstruction from events.
//!
//! A PipelineRun represents a single execution of a pipeline, from trigger
//! to terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, RunCreated};
use super::stage::{StageResult, StageStatus};
use crate::error::PipelineError;

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCause {
    /// A push to the source repository
    Push,

    /// An explicit request
    #[default]
    Manual,
}

/// Request to run a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Source revision to build and deploy (commit id, tag)
    pub source_revision: String,

    /// Environment the run targets
    pub environment: String,

    #[serde(default)]
    pub cause: TriggerCause,
}

impl Trigger {
    pub fn manual(source_revision: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            source_revision: source_revision.into(),
            environment: environment.into(),
            cause: TriggerCause::Manual,
        }
    }

    pub fn push(source_revision: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            cause: TriggerCause::Push,
            ..Self::manual(source_revision, environment)
        }
    }
}

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the pipeline being executed
    pub pipeline_name: String,

    /// What started this run
    pub trigger: Trigger,

    /// Overall status
    pub status: RunStatus,

    /// One result per declared stage, in declared order
    pub stages: Vec<StageResult>,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// When the run started executing
    pub started_at: Option<DateTime<Utc>>,

    /// When the run reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Create a new pending run
    pub fn new(id: Uuid, pipeline_name: String, trigger: Trigger, stage_names: &[String]) -> Self {
        Self {
            id,
            pipeline_name,
            trigger,
            status: RunStatus::Pending,
            stages: stage_names.iter().map(StageResult::pending).collect(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;
        let created: RunCreated = first_event
            .payload
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())?;

        let mut run = Self::new(
            first_event.run_id,
            created.pipeline,
            created.trigger,
            &created.stages,
        );
        run.created_at = first_event.timestamp;

        for event in &events[1..] {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state.
    ///
    /// Terminal runs are immutable: later events are ignored.
    pub fn apply_event(&mut self, event: &Event) {
        if self.is_terminal() || event.run_id != self.id {
            return;
        }

        match event.event_type {
            EventType::RunCreated | EventType::NotificationPublished => {}
            EventType::RunStarted => {
                self.status = RunStatus::Running;
                self.started_at = Some(event.timestamp);
            }
            EventType::RunSucceeded => self.finish(RunStatus::Succeeded, event),
            EventType::RunFailed => self.finish(
                RunStatus::Failed {
                    error: event.error.clone().unwrap_or_default(),
                },
                event,
            ),
            EventType::RunRolledBack => self.finish(
                RunStatus::RolledBack {
                    reason: event.error.clone().unwrap_or_default(),
                },
                event,
            ),
            EventType::StageStarted => {
                if let Some(stage) = self.stage_mut(event) {
                    stage.status = StageStatus::Running;
                    stage.attempts = event.attempt.unwrap_or(stage.attempts + 1);
                }
            }
            EventType::StageRetrying => {
                let error: Option<PipelineError> = event
                    .payload
                    .clone()
                    .and_then(|p| serde_json::from_value(p).ok());
                if let Some(stage) = self.stage_mut(event) {
                    stage.attempt_errors.extend(error);
                }
            }
            EventType::StageSucceeded | EventType::StageFailed | EventType::StageRolledBack => {
                let result: Option<StageResult> = event
                    .payload
                    .clone()
                    .and_then(|p| serde_json::from_value(p).ok());
                let status = event.status.unwrap_or(match event.event_type {
                    EventType::StageSucceeded => StageStatus::Succeeded,
                    EventType::StageRolledBack => StageStatus::RolledBack,
                    _ => StageStatus::Failed,
                });
                if let Some(stage) = self.stage_mut(event) {
                    if let Some(result) = result {
                        *stage = result;
                    }
                    stage.status = status;
                    stage.duration_ms = event.duration_ms.or(stage.duration_ms);
                }
            }
            EventType::StageSkipped => {
                if let Some(stage) = self.stage_mut(event) {
                    stage.status = StageStatus::Skipped;
                }
            }
            EventType::RolloutPhaseChanged => {}
        }
    }

    fn finish(&mut self, status: RunStatus, event: &Event) {
        self.status = status;
        self.completed_at = Some(event.timestamp);
    }

    fn stage_mut(&mut self, event: &Event) -> Option<&mut StageResult> {
        let name = event.stage.as_deref()?;
        self.stages.iter_mut().find(|s| s.name == name)
    }

    /// Check if the run has reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Result of a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Overall status of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Created, not yet executing
    #[default]
    Pending,

    /// Executing stages
    Running,

    /// Every stage succeeded
    Succeeded,

    /// A stage failed
    Failed { error: String },

    /// A deploy was rolled back
    RolledBack { reason: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::RolledBack { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::RolledBack { .. } => "rolled_back",
        }
    }
}
