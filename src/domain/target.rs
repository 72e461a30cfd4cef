//! Deployment targets and their traffic state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::deploy::{DeploymentHooks, Strategy};

/// Percentage of traffic per revision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrafficSplit(BTreeMap<String, u8>);

impl TrafficSplit {
    /// All traffic on one revision
    pub fn single(revision: &str) -> Self {
        Self::shifted(None, revision, 100)
    }

    /// `percent` on `to`, the remainder on `from`
    pub fn shifted(from: Option<&str>, to: &str, percent: u8) -> Self {
        let percent = percent.min(100);
        let mut weights = BTreeMap::new();
        match from {
            Some(from) if from != to && percent < 100 => {
                weights.insert(from.to_string(), 100 - percent);
                weights.insert(to.to_string(), percent);
            }
            _ => {
                weights.insert(to.to_string(), 100);
            }
        }
        Self(weights)
    }

    pub fn percent_for(&self, revision: &str) -> u8 {
        self.0.get(revision).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u8)> {
        self.0.iter()
    }

    /// `rev=pct` pairs joined by commas
    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(|(rev, pct)| format!("{}={}", rev, pct))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Last known health of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Bookkeeping for a rollout that has started but not finished.
///
/// Persisted before any host is touched so that a rollback, including one
/// issued after a crash, knows what to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightRollout {
    pub rollout_id: Uuid,
    pub run_id: Uuid,
    pub revision: String,
    pub prior_revision: Option<String>,
    pub prior_traffic: TrafficSplit,
    pub strategy: Strategy,
    pub hooks: DeploymentHooks,
    pub artifact_dir: Option<PathBuf>,
    /// Artifact directory of the prior revision, for reinstalling it
    #[serde(default)]
    pub prior_artifact_dir: Option<PathBuf>,
    /// Hosts touched by the new revision so far
    #[serde(default)]
    pub replaced_hosts: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// A set of hosts serving one application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub name: String,
    pub hosts: Vec<String>,
    pub current_revision: Option<String>,
    pub previous_revision: Option<String>,
    /// Artifact directory the current revision was installed from
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
    #[serde(default)]
    pub traffic: TrafficSplit,
    #[serde(default)]
    pub health: HealthState,
    pub in_flight: Option<InFlightRollout>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentTarget {
    pub fn new(name: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            name: name.into(),
            hosts,
            current_revision: None,
            previous_revision: None,
            artifact_dir: None,
            traffic: TrafficSplit::default(),
            health: HealthState::Unknown,
            in_flight: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether a rollout is underway (or was interrupted)
    pub fn is_rolling_out(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether `revision` is live with no rollout pending
    pub fn is_at(&self, revision: &str) -> bool {
        !self.is_rolling_out() && self.current_revision.as_deref() == Some(revision)
    }

    /// Move the revision pointer after a successful rollout
    pub fn promote(&mut self, revision: &str, artifact_dir: Option<PathBuf>) {
        self.previous_revision = self.current_revision.take();
        self.current_revision = Some(revision.to_string());
        self.artifact_dir = artifact_dir;
        self.traffic = TrafficSplit::single(revision);
        self.in_flight = None;
    }
}
