//! Rollout phases and reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::LogLine;
use super::target::TrafficSplit;
use crate::error::PipelineError;

/// Phase of the Rollout Controller's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    Idle,
    Provisioning,
    TrafficShifting,
    Verifying,
    Complete,
    RollingBack,
    RolledBack,
}

impl RolloutPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::RolledBack)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: RolloutPhase) -> bool {
        use RolloutPhase::*;
        match (self, next) {
            (Idle, Provisioning) | (Idle, Complete) | (Idle, RollingBack) => true,
            (Provisioning, TrafficShifting) | (Provisioning, RollingBack) => true,
            (TrafficShifting, Verifying) | (TrafficShifting, RollingBack) => true,
            (Verifying, TrafficShifting)
            | (Verifying, Provisioning)
            | (Verifying, Complete)
            | (Verifying, RollingBack) => true,
            (RollingBack, RolledBack) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::TrafficShifting => "traffic_shifting",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// A recorded move between phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: RolloutPhase,
    pub at: DateTime<Utc>,
    pub detail: String,
}

/// How a rollout ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RolloutOutcome {
    /// The new revision is live
    Complete,

    /// The target was already at the requested revision
    AlreadyCurrent,

    /// The prior revision and traffic were restored
    RolledBack { reason: String },
}

/// Everything that happened during one rollout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutReport {
    pub rollout_id: Uuid,
    pub target: String,
    pub revision: String,
    pub prior_revision: Option<String>,
    pub outcome: RolloutOutcome,
    pub transitions: Vec<PhaseTransition>,
    pub final_traffic: TrafficSplit,
    /// Failure that caused the rollback
    #[serde(default)]
    pub error: Option<PipelineError>,
    #[serde(default)]
    pub logs: Vec<LogLine>,
}

impl RolloutReport {
    /// Phases visited, in order
    pub fn phases(&self) -> Vec<RolloutPhase> {
        self.transitions.iter().map(|t| t.phase).collect()
    }

    pub fn final_phase(&self) -> RolloutPhase {
        self.transitions
            .last()
            .map(|t| t.phase)
            .unwrap_or(RolloutPhase::Idle)
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self.outcome, RolloutOutcome::RolledBack { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use RolloutPhase::*;

        assert!(Idle.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(TrafficShifting));
        assert!(TrafficShifting.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(TrafficShifting));
        assert!(Verifying.can_transition_to(Complete));
        assert!(Verifying.can_transition_to(RollingBack));
        assert!(RollingBack.can_transition_to(RolledBack));

        assert!(!Complete.can_transition_to(RollingBack));
        assert!(!RolledBack.can_transition_to(RollingBack));
        assert!(!Provisioning.can_transition_to(Complete));
    }
}
