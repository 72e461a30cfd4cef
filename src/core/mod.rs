//! Core delivery logic.
//!
//! This module contains:
//! - EventStore: Append-only run log
//! - Pipeline: Pipeline definitions and loading
//! - ArtifactStore: Content-addressable stage outputs
//! - StageExecutor: Command stages with retry and timeout
//! - HealthChecker / RolloutController: Gated traffic shifting and rollback
//! - Notifier: Background delivery of terminal run events
//! - PipelineEngine: Main execution engine

pub mod artifact_store;
pub mod engine;
pub mod event_store;
pub mod executor;
pub mod health;
pub mod notifier;
pub mod pipeline;
pub mod rollout;
pub mod targets;

// Re-export commonly used types
pub use artifact_store::ArtifactStore;
pub use tokio_util::sync::CancellationToken;
pub use engine::{EngineBuilder, EnginePaths, PipelineEngine, RunHandle};
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use executor::{StageContext, StageExecutor};
pub use health::{HealthChecker, PollRound, Verification};
pub use notifier::{DeliveryReport, NotificationSettings, Notifier, NotifierConfig};
pub use pipeline::{
    DeploySpec, HealthProbeSpec, Pipeline, RetryPolicy, RolloutDefaults, StageDef, TargetDef, TrafficShiftConfig, VerifyConfig,
};
pub use rollout::{RolloutController, RolloutRequest};
pub use targets::{TargetLease, TargetStore};
