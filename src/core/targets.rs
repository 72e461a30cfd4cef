//! Persisted deployment targets with per-target mutual exclusion.
//!
//! Each target is a JSON record under the targets directory. Mutations
//! require a [`TargetLease`], which holds that target's async mutex, so two
//! rollouts never race on the same revision pointer while rollouts on
//! different targets proceed independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::pipeline::check_name;
use crate::domain::DeploymentTarget;

/// Exclusive access to one target
pub struct TargetLease {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl TargetLease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct TargetStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TargetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to a target
    pub async fn lock(&self, name: &str) -> TargetLease {
        let guard = self.lock_for(name).lock_owned().await;
        debug!(target_name = name, "Acquired target lease");
        TargetLease {
            name: name.to_string(),
            _guard: guard,
        }
    }

    /// Take exclusive access only if nobody holds it
    pub fn try_lock(&self, name: &str) -> Option<TargetLease> {
        let guard = self.lock_for(name).try_lock_owned().ok()?;
        Some(TargetLease {
            name: name.to_string(),
            _guard: guard,
        })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        check_name("Target", name)?;
        Ok(self.dir.join(format!("{}.json", name)))
    }

    /// Read a target record (no lease needed for reads)
    pub async fn load(&self, name: &str) -> Result<Option<DeploymentTarget>> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read(&path)
            .await
            .with_context(|| format!("Failed to read target: {}", path.display()))?;
        let target = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse target: {}", path.display()))?;
        Ok(Some(target))
    }

    /// Load a target, creating it with `hosts` if it does not exist yet.
    /// The host list follows the definition; revision state is kept.
    pub async fn load_or_init(&self, lease: &TargetLease, hosts: &[String]) -> Result<DeploymentTarget> {
        let mut target = match self.load(lease.name()).await? {
            Some(target) => target,
            None => DeploymentTarget::new(lease.name(), hosts.to_vec()),
        };
        if !hosts.is_empty() {
            target.hosts = hosts.to_vec();
        }
        Ok(target)
    }

    /// Persist a target atomically (write to a temp file, then rename)
    pub async fn save(&self, lease: &TargetLease, target: &mut DeploymentTarget) -> Result<()> {
        if lease.name() != target.name {
            anyhow::bail!(
                "Lease for '{}' cannot write target '{}'",
                lease.name(),
                target.name
            );
        }

        let path = self.path_for(&target.name)?;
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create targets directory: {}", self.dir.display()))?;

        target.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(target).context("Failed to serialize target")?;
        let tmp = self.dir.join(format!(".{}.{}.tmp", target.name, Uuid::new_v4()));

        fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write target: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace target: {}", path.display()))?;

        Ok(())
    }

    /// All persisted targets, sorted by name
    pub async fn list(&self) -> Result<Vec<DeploymentTarget>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut targets = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(".json").filter(|s| check_name("Target", s).is_ok()) {
                if let Some(target) = self.load(stem).await? {
                    targets.push(target);
                }
            }
        }

        targets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(targets)
    }
}
