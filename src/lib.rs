//! conveyor - owned continuous delivery engine
//!
//! Runs YAML-defined pipelines of ordered stages against a set of hosts.
//! Command stages run shell steps with retries and timeouts; deploy stages
//! roll a revision out blue/green or rolling, gated by health checks, and
//! roll back on failure. Terminal run states are published to pluggable
//! notification sinks.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every run state change is recorded as an immutable event
//! - A run's state is derived by replaying its events
//! - Deployment targets are small JSON records guarded by per-target locks
//!
//! # Modules
//!
//! - `adapters`: External system integrations (processes, HTTP, routers, sinks)
//! - `core`: Engine, executor, rollout controller, health checker, notifier, stores
//! - `domain`: Data structures (Event, PipelineRun, StageResult, DeploymentTarget)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! conveyor run web --revision 4f2a9c1 --env production
//!
//! # Check run status and a stage's log
//! conveyor status <run-id>
//! conveyor logs <run-id> build
//!
//! # Undo an interrupted rollout
//! conveyor rollback production --pipeline web
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use core::{CancellationToken, EnginePaths, Pipeline, PipelineEngine, RunHandle};
pub use domain::{DeploymentTarget, Event, EventType, PipelineRun, RunStatus, StageResult, StageStatus, Trigger};
pub use error::PipelineError;
