//! Domain types for the conveyor engine.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of state changes
//! - PipelineRun / StageResult: Run execution state
//! - Artifact: Stage outputs
//! - DeploymentTarget: Hosts, revision pointer and traffic
//! - Rollout: Phases and reports of the Rollout Controller

pub mod artifact;
pub mod deploy;
pub mod events;
pub mod rollout;
pub mod run;
pub mod stage;
pub mod target;

// Re-export commonly used types
pub use artifact::Artifact;
pub use deploy::{DeploymentHooks, HookName, HookSpec, Strategy};
pub use events::{Event, EventType, NotificationEvent, RunCreated};
pub use rollout::{PhaseTransition, RolloutOutcome, RolloutPhase, RolloutReport};
pub use run::{PipelineRun, RunStatus, Trigger, TriggerCause};
pub use stage::{LogLine, LogStream, StageResult, StageStatus};
pub use target::{DeploymentTarget, HealthState, InFlightRollout, TrafficSplit};
