//! Event types for the event-sourced engine.
//!
//! Every state change of a run is recorded as an immutable event in an
//! append-only log. Notification events are what subscribers receive when a
//! run reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{RunStatus, Trigger};
use super::stage::StageStatus;

/// A single event in the append-only event log.
///
/// Events are the source of truth for run state. The current state of any run
/// can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Stage name (if applicable)
    pub stage: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{scope}:{hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Stage status after this event (stage events only)
    pub status: Option<StageStatus>,

    /// Attempt number (stage events only)
    pub attempt: Option<u32>,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured data needed to rebuild state on replay
    pub payload: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        stage: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage,
            event_type,
            idempotency_key,
            payload_summary,
            status: None,
            attempt: None,
            duration_ms: None,
            error: None,
            payload: None,
        }
    }

    pub fn with_status(mut self, status: StageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach a serialized payload. Serialization failures leave it empty.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }
}

/// Types of events that can occur during a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run was created from a trigger
    RunCreated,

    /// The run began executing stages
    RunStarted,

    /// Every stage succeeded
    RunSucceeded,

    /// A stage failed and the run was aborted
    RunFailed,

    /// A deploy stage was rolled back and the run was aborted
    RunRolledBack,

    /// A stage attempt has started
    StageStarted,

    /// A stage attempt failed and will be retried
    StageRetrying,

    /// A stage completed successfully
    StageSucceeded,

    /// A stage failed permanently
    StageFailed,

    /// A deploy stage's rollout was rolled back
    StageRolledBack,

    /// A stage was skipped after an earlier stage did not succeed
    StageSkipped,

    /// The rollout of a deploy stage changed phase
    RolloutPhaseChanged,

    /// The terminal notification was handed to the notifier
    NotificationPublished,
}

impl EventType {
    /// Events that end a run
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunSucceeded | Self::RunFailed | Self::RunRolledBack
        )
    }
}

/// Payload of `RunCreated`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreated {
    pub pipeline: String,
    pub trigger: Trigger,
    pub stages: Vec<String>,
}

/// What subscribers receive when a run reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub timestamp: DateTime<Utc>,
    pub source_revision: String,
    pub environment: String,
    pub error: Option<String>,
}

impl NotificationEvent {
    /// One-line summary for chat or email transports
    pub fn summary(&self) -> String {
        let mut text = format!(
            "[{}] {} {} ({} @ {})",
            self.status.label(),
            self.pipeline,
            self.run_id,
            self.environment,
            self.source_revision
        );
        if let Some(ref error) = self.error {
            text.push_str(": ");
            text.push_str(error);
        }
        text
    }
}
